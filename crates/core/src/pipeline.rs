//! Run-level input, output and the per-run execution state.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::approval::ApprovalPayload;
use crate::domain::routing::{Channel, Domain, RequestClassification, RiskLevel};
use crate::trace::StageTraceSummary;

type JsonObject = Map<String, Value>;

static FLOW_ID_UNSAFE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9.]+").unwrap());

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorInput {
    pub message: String,
    pub user_id: String,
    #[serde(default = "default_user_role")]
    pub user_role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_state: Option<JsonObject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<ConversationTurn>,
}

fn default_user_role() -> String {
    "user".to_string()
}

impl OrchestratorInput {
    pub fn new(
        message: impl Into<String>,
        user_id: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            user_id: user_id.into(),
            user_role: default_user_role(),
            workspace_id: None,
            trace_id: trace_id.into(),
            session_state: None,
            history: Vec::new(),
        }
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    fn user_prefix(&self) -> String {
        self.user_id.chars().take(8).collect()
    }
}

pub fn pipeline_id(input: &OrchestratorInput, now: DateTime<Utc>) -> String {
    format!("pipeline_{}_{}", now.timestamp_millis(), input.user_prefix())
}

pub fn tool_plan_id(input: &OrchestratorInput, now: DateTime<Utc>) -> String {
    format!("toolplan_{}_{}", now.timestamp_millis(), input.user_prefix())
}

pub fn normalize_intent_for_flow_id(intent_id: &str) -> String {
    let lowered = intent_id.trim().to_lowercase();
    let replaced = FLOW_ID_UNSAFE.replace_all(&lowered, "_");
    let trimmed = replaced.trim_matches(|c| c == '_' || c == '.');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn flow_id(classification: &RequestClassification) -> String {
    format!(
        "orch.{}.{}",
        classification.domain,
        normalize_intent_for_flow_id(&classification.intent_id)
    )
}

/// What the tool executor hands back for one call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing_options: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_state: Option<JsonObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_state: Option<JsonObject>,
}

impl ToolExecutionResult {
    pub fn succeeded(result: Value) -> Self {
        Self { success: true, result: Some(result), ..Self::default() }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()), ..Self::default() }
    }
}

/// State carried across executed steps within one run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing_options: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_state: Option<JsonObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_state: Option<JsonObject>,
}

impl ExecutionState {
    /// Fold one tool result into the carried state. Present fields replace the
    /// previous value, except agent state which is merged key by key.
    pub fn merge(self, result: &ToolExecutionResult) -> Self {
        let agent_state = match (self.agent_state, &result.agent_state) {
            (Some(current), Some(update)) => Some(shallow_merge(current, update)),
            (current, update) => update.clone().or(current),
        };

        Self {
            message: non_empty(&result.message).or(self.message),
            clarification_request: non_empty(&result.clarification_request)
                .or(self.clarification_request),
            pricing_options: result.pricing_options.clone().or(self.pricing_options),
            session_state: result.session_state.clone().or(self.session_state),
            agent_state,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|text| !text.is_empty()).cloned()
}

pub fn shallow_merge(mut base: JsonObject, update: &JsonObject) -> JsonObject {
    for (key, value) in update {
        base.insert(key.clone(), value.clone());
    }
    base
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub success: bool,
    pub tool: String,
    pub task_id: String,
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub risk_level: RiskLevel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Clarification,
    ApprovalRequired,
    ControlledError,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorMetadata {
    pub flow_id: String,
    pub intent_id: String,
    pub channel: Channel,
    pub domain: Domain,
    pub pipeline_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_plan_id: Option<String>,
    pub stage_trace: StageTraceSummary,
    pub risk_level: RiskLevel,
    pub approval_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_payload: Option<ApprovalPayload>,
    pub outcome: RunOutcome,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorOutput {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing_options: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_state: Option<JsonObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_state: Option<JsonObject>,
    pub metadata: OrchestratorMetadata,
    #[serde(default)]
    pub steps: Vec<StepResult>,
}
