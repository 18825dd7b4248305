//! The ten model-backed stages, each a [`StageRunner`] configuration with a
//! fixed system instruction, a JSON user payload and its contract parser.

use serde_json::{json, Value};
use stagewise_core::contracts::{
    self, Aggregation, Decomposition, Finalization, NormalizedCommand, StepPlan, TaskPlan,
    ToolAnalysis, ToolArgumentDraft, ToolCallConfirmation,
};
use stagewise_core::domain::planning::{DomainTask, ToolPlanStep};
use stagewise_core::domain::routing::{Domain, RequestClassification};
use stagewise_core::domain::tool::{ToolCatalog, ToolSpec};
use stagewise_core::errors::StageExecutionError;
use stagewise_core::models::ModelRole;
use stagewise_core::pipeline::{ExecutionState, OrchestratorInput, StepResult};
use stagewise_core::trace::StageTrace;

use crate::llm::ChatMessage;
use crate::prompts::{system_prompt, REQUEST_MANAGER_DISAMBIGUATION};
use crate::runner::StageRunner;

const HISTORY_WINDOW: usize = 6;

/// Everything the aggregator sees about the executed steps.
#[derive(Clone, Copy, Debug)]
pub struct AggregationInput<'a> {
    pub tool_plan_id: &'a str,
    pub steps: &'a [StepResult],
    pub approval_required: bool,
    pub execution: &'a ExecutionState,
}

pub struct Stages<'a> {
    runner: &'a StageRunner<'a>,
    input: &'a OrchestratorInput,
}

impl<'a> Stages<'a> {
    pub fn new(runner: &'a StageRunner<'a>, input: &'a OrchestratorInput) -> Self {
        Self { runner, input }
    }

    fn messages(
        &self,
        role: ModelRole,
        domain: Option<Domain>,
        attempt: u32,
        last_error: Option<&str>,
        artifacts: Value,
    ) -> Vec<ChatMessage> {
        let mut system = system_prompt(role, domain);
        if role == ModelRole::RequestManager && attempt > 1 {
            system.push_str("\n\n");
            system.push_str(REQUEST_MANAGER_DISAMBIGUATION);
        }

        let history = self
            .input
            .history
            .iter()
            .rev()
            .take(HISTORY_WINDOW)
            .rev()
            .map(|turn| json!({"role": turn.role, "content": turn.content}))
            .collect::<Vec<_>>();

        let mut payload = json!({
            "attempt": attempt,
            "previousError": last_error,
            "userMessage": self.input.message,
            "userRole": self.input.user_role,
            "history": history,
            "sessionState": self.input.session_state,
        });
        if let (Value::Object(payload), Value::Object(artifacts)) = (&mut payload, artifacts) {
            payload.extend(artifacts);
        }

        vec![ChatMessage::system(system), ChatMessage::user(payload.to_string())]
    }

    pub async fn classify(
        &self,
        trace: &mut StageTrace,
    ) -> Result<RequestClassification, StageExecutionError> {
        self.runner
            .run(
                ModelRole::RequestManager,
                None,
                trace,
                |attempt, last_error| {
                    self.messages(ModelRole::RequestManager, None, attempt, last_error, json!({}))
                },
                contracts::parse_request_classification,
            )
            .await
    }

    pub async fn decompose(
        &self,
        classification: &RequestClassification,
        trace: &mut StageTrace,
    ) -> Result<Decomposition, StageExecutionError> {
        let role = ModelRole::DomainDecomposer;
        let domain = classification.domain;
        self.runner
            .run(
                role,
                Some(domain),
                trace,
                |attempt, last_error| {
                    self.messages(
                        role,
                        Some(domain),
                        attempt,
                        last_error,
                        json!({ "classification": classification }),
                    )
                },
                |raw| contracts::parse_decomposition(raw, domain, &classification.intent_id),
            )
            .await
    }

    pub async fn plan_tasks(
        &self,
        classification: &RequestClassification,
        subtasks: &[DomainTask],
        trace: &mut StageTrace,
    ) -> Result<TaskPlan, StageExecutionError> {
        let role = ModelRole::TaskPlanner;
        let domain = classification.domain;
        self.runner
            .run(
                role,
                Some(domain),
                trace,
                |attempt, last_error| {
                    self.messages(
                        role,
                        Some(domain),
                        attempt,
                        last_error,
                        json!({ "classification": classification, "subtasks": subtasks }),
                    )
                },
                |raw| contracts::parse_task_plan(raw, domain),
            )
            .await
    }

    pub async fn plan_steps(
        &self,
        classification: &RequestClassification,
        task: &DomainTask,
        catalog: &ToolCatalog,
        trace: &mut StageTrace,
    ) -> Result<StepPlan, StageExecutionError> {
        let role = ModelRole::Planner;
        let domain = classification.domain;
        let tools = catalog_summary(catalog);
        self.runner
            .run(
                role,
                Some(domain),
                trace,
                |attempt, last_error| {
                    self.messages(
                        role,
                        Some(domain),
                        attempt,
                        last_error,
                        json!({ "classification": classification, "task": task, "tools": tools }),
                    )
                },
                |raw| contracts::parse_step_plan(raw, &task.id),
            )
            .await
    }

    pub async fn analyze_tool(
        &self,
        classification: &RequestClassification,
        step: &ToolPlanStep,
        catalog: &ToolCatalog,
        trace: &mut StageTrace,
    ) -> Result<ToolAnalysis, StageExecutionError> {
        let role = ModelRole::ToolAnalysis;
        let domain = classification.domain;
        let candidates = catalog_summary(
            &ToolCatalog::new(
                catalog.iter().filter(|tool| step.has_candidate(&tool.name)).cloned().collect(),
            ),
        );
        self.runner
            .run(
                role,
                Some(domain),
                trace,
                |attempt, last_error| {
                    self.messages(
                        role,
                        Some(domain),
                        attempt,
                        last_error,
                        json!({
                            "classification": classification,
                            "step": step,
                            "candidateTools": candidates,
                        }),
                    )
                },
                |raw| contracts::parse_tool_analysis(raw, &step.tool_candidates),
            )
            .await
    }

    pub async fn draft_arguments(
        &self,
        classification: &RequestClassification,
        step: &ToolPlanStep,
        analysis: &ToolAnalysis,
        tool: &ToolSpec,
        trace: &mut StageTrace,
    ) -> Result<ToolArgumentDraft, StageExecutionError> {
        let role = ModelRole::ToolArgument;
        let domain = classification.domain;
        self.runner
            .run(
                role,
                Some(domain),
                trace,
                |attempt, last_error| {
                    self.messages(
                        role,
                        Some(domain),
                        attempt,
                        last_error,
                        json!({
                            "classification": classification,
                            "step": step,
                            "analysis": analysis,
                            "tool": tool,
                        }),
                    )
                },
                contracts::parse_tool_argument_draft,
            )
            .await
    }

    pub async fn confirm_call(
        &self,
        classification: &RequestClassification,
        draft: &ToolArgumentDraft,
        tool: &ToolSpec,
        trace: &mut StageTrace,
    ) -> Result<ToolCallConfirmation, StageExecutionError> {
        let role = ModelRole::ToolCaller;
        let domain = classification.domain;
        self.runner
            .run(
                role,
                Some(domain),
                trace,
                |attempt, last_error| {
                    self.messages(
                        role,
                        Some(domain),
                        attempt,
                        last_error,
                        json!({ "classification": classification, "draft": draft, "tool": tool }),
                    )
                },
                contracts::parse_tool_call_confirmation,
            )
            .await
    }

    pub async fn build_command(
        &self,
        classification: &RequestClassification,
        confirmation: &ToolCallConfirmation,
        tool: &ToolSpec,
        trace: &mut StageTrace,
    ) -> Result<NormalizedCommand, StageExecutionError> {
        let role = ModelRole::CommandBuilder;
        let domain = classification.domain;
        self.runner
            .run(
                role,
                Some(domain),
                trace,
                |attempt, last_error| {
                    self.messages(
                        role,
                        Some(domain),
                        attempt,
                        last_error,
                        json!({
                            "classification": classification,
                            "call": confirmation,
                            "tool": tool,
                        }),
                    )
                },
                contracts::parse_normalized_command,
            )
            .await
    }

    pub async fn aggregate(
        &self,
        classification: &RequestClassification,
        results: AggregationInput<'_>,
        trace: &mut StageTrace,
    ) -> Result<Aggregation, StageExecutionError> {
        let role = ModelRole::Aggregator;
        let domain = classification.domain;
        let artifacts = json!({
            "classification": classification,
            "toolPlanId": results.tool_plan_id,
            "steps": results.steps,
            "approvalRequired": results.approval_required,
            "clarificationRequest": results.execution.clarification_request,
            "pricingOptions": results.execution.pricing_options,
            "sessionState": results.execution.session_state,
            "agentState": results.execution.agent_state,
        });
        self.runner
            .run(
                role,
                Some(domain),
                trace,
                |attempt, last_error| {
                    self.messages(role, Some(domain), attempt, last_error, artifacts.clone())
                },
                contracts::parse_aggregation,
            )
            .await
    }

    pub async fn finalize(
        &self,
        classification: &RequestClassification,
        aggregation: &Aggregation,
        trace: &mut StageTrace,
    ) -> Result<Finalization, StageExecutionError> {
        let role = ModelRole::Finalizer;
        let domain = classification.domain;
        self.runner
            .run(
                role,
                Some(domain),
                trace,
                |attempt, last_error| {
                    self.messages(
                        role,
                        Some(domain),
                        attempt,
                        last_error,
                        json!({ "classification": classification, "aggregated": aggregation }),
                    )
                },
                contracts::parse_finalization,
            )
            .await
    }
}

fn catalog_summary(catalog: &ToolCatalog) -> Vec<Value> {
    catalog
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "required": tool.required,
                "riskLevel": tool.risk_level,
            })
        })
        .collect()
}
