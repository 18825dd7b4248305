use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::ModelRole;

pub const DEFAULT_TOKEN_ALERT_THRESHOLD: u32 = 16_000;
pub const DIRECT_PATH_MODEL: &str = "orchestrator_direct";
pub const POLICY_MODEL: &str = "orchestrator_policy";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    RequestManager,
    DomainDecomposer,
    TaskPlanner,
    Planner,
    ToolAnalysis,
    ToolArgument,
    ToolCaller,
    CommandBuilder,
    Aggregator,
    Finalizer,
    PolicyToolSafety,
    PolicyApproval,
    ToolExecutor,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestManager => "request_manager",
            Self::DomainDecomposer => "domain_decomposer",
            Self::TaskPlanner => "task_planner",
            Self::Planner => "planner",
            Self::ToolAnalysis => "tool_analysis",
            Self::ToolArgument => "tool_argument",
            Self::ToolCaller => "tool_caller",
            Self::CommandBuilder => "command_builder",
            Self::Aggregator => "aggregator",
            Self::Finalizer => "finalizer",
            Self::PolicyToolSafety => "policy_tool_safety",
            Self::PolicyApproval => "policy_approval",
            Self::ToolExecutor => "tool_executor",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ModelRole> for Stage {
    fn from(role: ModelRole) -> Self {
        match role {
            ModelRole::RequestManager => Self::RequestManager,
            ModelRole::DomainDecomposer => Self::DomainDecomposer,
            ModelRole::TaskPlanner => Self::TaskPlanner,
            ModelRole::Planner => Self::Planner,
            ModelRole::ToolAnalysis => Self::ToolAnalysis,
            ModelRole::ToolArgument => Self::ToolArgument,
            ModelRole::ToolCaller => Self::ToolCaller,
            ModelRole::CommandBuilder => Self::CommandBuilder,
            ModelRole::Aggregator => Self::Aggregator,
            ModelRole::Finalizer => Self::Finalizer,
        }
    }
}

/// Outcome and cost of a single stage attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTraceEntry {
    pub stage: Stage,
    pub attempt: u32,
    pub duration_ms: u64,
    pub success: bool,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
    #[serde(default)]
    pub token_alert: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
}

impl StageTraceEntry {
    /// Zero-cost placeholder recorded for stages skipped by the direct path.
    pub fn bypassed(stage: Stage) -> Self {
        Self::bare(stage, 0, true, DIRECT_PATH_MODEL, None)
    }

    pub fn policy(stage: Stage, success: bool, duration_ms: u64, error_code: Option<&str>) -> Self {
        Self::bare(stage, duration_ms, success, POLICY_MODEL, error_code.map(str::to_string))
    }

    fn bare(
        stage: Stage,
        duration_ms: u64,
        success: bool,
        model: &str,
        error_code: Option<String>,
    ) -> Self {
        Self {
            stage,
            attempt: 1,
            duration_ms,
            success,
            model: model.to_string(),
            error_code,
            input_tokens: None,
            output_tokens: None,
            total_tokens: None,
            token_alert: false,
            raw_input: None,
            raw_output: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageSummary {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub token_alert_count: u32,
    pub token_alert_threshold: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTraceSummary {
    pub last_stage: Stage,
    pub total_duration_ms: u64,
    pub token_usage: TokenUsageSummary,
    pub entries: Vec<StageTraceEntry>,
}

/// Append-only trace for one run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StageTrace {
    entries: Vec<StageTraceEntry>,
}

impl StageTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: StageTraceEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[StageTraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn summary(&self, token_alert_threshold: u32) -> StageTraceSummary {
        let sum = |pick: fn(&StageTraceEntry) -> Option<u32>| {
            self.entries.iter().map(|entry| u64::from(pick(entry).unwrap_or(0))).sum::<u64>()
        };

        StageTraceSummary {
            last_stage: self.entries.last().map_or(Stage::RequestManager, |entry| entry.stage),
            total_duration_ms: self.entries.iter().map(|entry| entry.duration_ms).sum(),
            token_usage: TokenUsageSummary {
                input_tokens: sum(|entry| entry.input_tokens),
                output_tokens: sum(|entry| entry.output_tokens),
                total_tokens: sum(|entry| entry.total_tokens),
                token_alert_count: self.entries.iter().filter(|entry| entry.token_alert).count()
                    as u32,
                token_alert_threshold,
            },
            entries: self.entries.clone(),
        }
    }
}
