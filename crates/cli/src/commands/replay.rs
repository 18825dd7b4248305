use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use stagewise_agent::{Orchestrator, ScriptedModelChat, Tool, ToolContext, ToolRegistry};
use stagewise_core::clock::FixedClock;
use stagewise_core::config::{AppConfig, LoadOptions};
use stagewise_core::domain::tool::{ToolCall, ToolSpec};
use stagewise_core::models::ModelRole;
use stagewise_core::pipeline::{OrchestratorInput, RunOutcome, ToolExecutionResult};
use tracing::info;
use uuid::Uuid;

use crate::commands::{CommandReport, FailureKind};
use crate::logging::init_logging;

const COMMAND: &str = "replay";

/// A recorded run: the request, the model replies per role in call order,
/// the tool catalog and what each tool returned.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayFixture {
    pub input: OrchestratorInput,
    #[serde(default)]
    pub responses: BTreeMap<ModelRole, Vec<String>>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub tool_results: BTreeMap<String, ToolExecutionResult>,
    #[serde(default)]
    pub now_ms: Option<i64>,
}

struct RecordedTool {
    spec: ToolSpec,
    result: Option<ToolExecutionResult>,
}

#[async_trait]
impl Tool for RecordedTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn execute(
        &self,
        _call: &ToolCall,
        _context: &ToolContext<'_>,
    ) -> Result<ToolExecutionResult> {
        Ok(self.result.clone().unwrap_or_else(|| {
            ToolExecutionResult::failed(format!("no recorded result for tool `{}`", self.spec.name))
        }))
    }
}

pub fn run(config_path: Option<&Path>, fixture_path: &Path, message: Option<&str>) -> CommandReport {
    let options =
        LoadOptions { config_path: config_path.map(Path::to_path_buf), ..LoadOptions::default() };
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandReport::failed(COMMAND, FailureKind::ConfigValidation, error.to_string())
        }
    };
    init_logging(&config);

    let raw = match fs::read_to_string(fixture_path) {
        Ok(raw) => raw,
        Err(error) => {
            return CommandReport::failed(
                COMMAND,
                FailureKind::FixtureRead,
                format!("failed to read {}: {error}", fixture_path.display()),
            )
        }
    };
    let mut fixture = match serde_json::from_str::<ReplayFixture>(&raw) {
        Ok(fixture) => fixture,
        Err(error) => {
            return CommandReport::failed(
                COMMAND,
                FailureKind::FixtureParse,
                format!("invalid fixture {}: {error}", fixture_path.display()),
            )
        }
    };

    if let Some(message) = message {
        fixture.input.message = message.to_string();
    }
    if fixture.input.trace_id.trim().is_empty() {
        fixture.input.trace_id = Uuid::new_v4().to_string();
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandReport::failed(COMMAND, FailureKind::Runtime, error.to_string())
        }
    };

    let orchestrator = build_orchestrator(&config, &mut fixture);
    info!(
        event_name = "cli.replay.started",
        trace_id = %fixture.input.trace_id,
        fixture = %fixture_path.display(),
        "replaying recorded run"
    );
    let output = runtime.block_on(orchestrator.run(&fixture.input));

    match serde_json::to_string_pretty(&output) {
        Ok(rendered) => CommandReport::printed(
            rendered,
            if output.metadata.outcome == RunOutcome::ControlledError { 1 } else { 0 },
        ),
        Err(error) => CommandReport::failed(COMMAND, FailureKind::Serialization, error.to_string()),
    }
}

fn build_orchestrator(config: &AppConfig, fixture: &mut ReplayFixture) -> Orchestrator {
    let mut chat = ScriptedModelChat::new();
    for (role, replies) in &fixture.responses {
        for reply in replies {
            chat = chat.with_reply(*role, reply.clone());
        }
    }

    let mut registry = ToolRegistry::new();
    for spec in fixture.tools.drain(..) {
        let result = fixture.tool_results.remove(&spec.name);
        registry.register(RecordedTool { spec, result });
    }

    let orchestrator = Orchestrator::new(Arc::new(chat), Arc::new(registry)).configured(config);
    match fixture.now_ms {
        Some(now_ms) => orchestrator.with_clock(Arc::new(FixedClock::at_millis(now_ms))),
        None => orchestrator,
    }
}
