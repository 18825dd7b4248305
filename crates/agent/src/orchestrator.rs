//! Top-level run: classify, plan, gate and execute tools, then aggregate and
//! finalize. Every run ends in exactly one of four outcomes and never
//! returns an error to the caller.

use std::mem;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use stagewise_core::clock::{Clock, SystemClock};
use stagewise_core::config::AppConfig;
use stagewise_core::contracts::{Aggregation, Finalization};
use stagewise_core::domain::approval::ApprovalPayload;
use stagewise_core::domain::routing::{RequestClassification, RiskLevel};
use stagewise_core::domain::tool::{ToolCall, ToolSpec};
use stagewise_core::errors::OrchestratorError;
use stagewise_core::models::{ModelResolver, StaticModelResolver};
use stagewise_core::pipeline::{
    flow_id, pipeline_id, shallow_merge, tool_plan_id, ExecutionState, OrchestratorInput,
    OrchestratorMetadata, OrchestratorOutput, RunOutcome, StepResult,
};
use stagewise_core::policy::approval::ApprovalPolicy;
use stagewise_core::policy::safety::{self, SafetyContext, SafetyDecision};
use stagewise_core::trace::{Stage, StageTrace, StageTraceEntry};
use tracing::{error, info};

use crate::direct_path;
use crate::llm::ModelChat;
use crate::runner::{RunnerSettings, StageRunner};
use crate::stages::{AggregationInput, Stages};
use crate::tools::{ToolContext, ToolExecutor};

pub const PENDING_ACTION_KEY: &str = "pendingAction";

const NO_TOOLS_MESSAGE: &str =
    "I have no tools available for this request. Tell me a more specific goal.";

enum Exit {
    Clarification(String),
    Approval(ApprovalPayload),
    Completed { aggregation: Aggregation, finalization: Finalization },
}

struct RunState {
    pipeline_id: String,
    tool_plan_id: String,
    classification: RequestClassification,
    trace: StageTrace,
    risk_level: RiskLevel,
    steps: Vec<StepResult>,
    execution: ExecutionState,
}

impl RunState {
    fn escalate(&mut self, observed: RiskLevel) {
        self.risk_level = self.risk_level.escalate(observed);
    }

    fn metadata(
        &self,
        outcome: RunOutcome,
        risk_level: RiskLevel,
        approval_payload: Option<ApprovalPayload>,
        token_alert_threshold: u32,
    ) -> OrchestratorMetadata {
        OrchestratorMetadata {
            flow_id: flow_id(&self.classification),
            intent_id: self.classification.intent_id.clone(),
            channel: self.classification.channel,
            domain: self.classification.domain,
            pipeline_id: self.pipeline_id.clone(),
            tool_plan_id: Some(self.tool_plan_id.clone()),
            stage_trace: self.trace.summary(token_alert_threshold),
            risk_level,
            approval_required: outcome == RunOutcome::ApprovalRequired,
            approval_payload,
            outcome,
        }
    }
}

pub struct Orchestrator {
    chat: Arc<dyn ModelChat>,
    tools: Arc<dyn ToolExecutor>,
    resolver: Arc<dyn ModelResolver>,
    clock: Arc<dyn Clock>,
    settings: RunnerSettings,
    approval: ApprovalPolicy,
    direct_path_enabled: bool,
}

impl Orchestrator {
    pub fn new(chat: Arc<dyn ModelChat>, tools: Arc<dyn ToolExecutor>) -> Self {
        Self {
            chat,
            tools,
            resolver: Arc::new(StaticModelResolver::default()),
            clock: Arc::new(SystemClock),
            settings: RunnerSettings::default(),
            approval: ApprovalPolicy::default(),
            direct_path_enabled: true,
        }
    }

    /// Apply the pipeline settings and model overrides from `config`.
    pub fn configured(self, config: &AppConfig) -> Self {
        Self {
            resolver: Arc::new(config.to_resolver()),
            settings: RunnerSettings::from(&config.pipeline),
            approval: ApprovalPolicy::with_ttl_secs(config.pipeline.approval_ttl_secs),
            direct_path_enabled: config.pipeline.direct_path_enabled,
            ..self
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ModelResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_settings(mut self, settings: RunnerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_approval_policy(mut self, approval: ApprovalPolicy) -> Self {
        self.approval = approval;
        self
    }

    pub fn with_direct_path(mut self, enabled: bool) -> Self {
        self.direct_path_enabled = enabled;
        self
    }

    pub async fn run(&self, input: &OrchestratorInput) -> OrchestratorOutput {
        let now = self.clock.now();
        let mut state = RunState {
            pipeline_id: pipeline_id(input, now),
            tool_plan_id: tool_plan_id(input, now),
            classification: RequestClassification::bootstrap(),
            trace: StageTrace::new(),
            risk_level: RiskLevel::Low,
            steps: Vec::new(),
            execution: ExecutionState::default(),
        };

        let threshold = self.settings.token_alert_threshold;
        match self.drive(input, &mut state).await {
            Ok(Exit::Clarification(message)) => {
                info!(
                    event_name = "pipeline.exit.clarification",
                    pipeline_id = %state.pipeline_id,
                    trace_id = %input.trace_id,
                    domain = state.classification.domain.as_str(),
                    "run stopped for clarification"
                );
                OrchestratorOutput {
                    message: message.clone(),
                    clarification_request: Some(message),
                    pricing_options: None,
                    session_state: None,
                    agent_state: None,
                    metadata: state.metadata(
                        RunOutcome::Clarification,
                        RiskLevel::Low,
                        None,
                        threshold,
                    ),
                    steps: state.steps,
                }
            }
            Ok(Exit::Approval(payload)) => {
                info!(
                    event_name = "pipeline.exit.approval_required",
                    pipeline_id = %state.pipeline_id,
                    trace_id = %input.trace_id,
                    tool = %payload.tool,
                    approval_id = %payload.id.0,
                    risk_level = state.risk_level.as_str(),
                    "run paused for human approval"
                );
                let mut agent_state = state.execution.agent_state.clone().unwrap_or_default();
                agent_state.insert(
                    PENDING_ACTION_KEY.to_string(),
                    serde_json::to_value(&payload).unwrap_or_default(),
                );
                let metadata = state.metadata(
                    RunOutcome::ApprovalRequired,
                    state.risk_level,
                    Some(payload.clone()),
                    threshold,
                );
                OrchestratorOutput {
                    message: payload.description.clone(),
                    clarification_request: Some(payload.description),
                    pricing_options: state.execution.pricing_options.take(),
                    session_state: state.execution.session_state.take(),
                    agent_state: Some(agent_state),
                    metadata,
                    steps: state.steps,
                }
            }
            Ok(Exit::Completed { aggregation, finalization }) => {
                let clarification_request = finalization
                    .clarification_request
                    .or_else(|| {
                        aggregation
                            .clarification_question
                            .clone()
                            .filter(|_| aggregation.clarification_required)
                    })
                    .or_else(|| state.execution.clarification_request.clone());
                let message =
                    clarification_request.clone().unwrap_or_else(|| finalization.message.clone());

                info!(
                    event_name = "pipeline.completed",
                    pipeline_id = %state.pipeline_id,
                    trace_id = %input.trace_id,
                    steps = state.steps.len(),
                    risk_level = state.risk_level.as_str(),
                    clarification = clarification_request.is_some(),
                    "run completed"
                );
                OrchestratorOutput {
                    message,
                    clarification_request,
                    pricing_options: state.execution.pricing_options.clone(),
                    session_state: Some(merge_states(
                        state.execution.session_state.clone(),
                        aggregation.session_state.as_ref(),
                    )),
                    agent_state: Some(merge_states(
                        state.execution.agent_state.clone(),
                        aggregation.agent_state.as_ref(),
                    )),
                    metadata: state.metadata(
                        RunOutcome::Completed,
                        state.risk_level,
                        None,
                        threshold,
                    ),
                    steps: state.steps,
                }
            }
            Err(failure) => {
                let interface = failure.into_interface(state.pipeline_id.clone());
                error!(
                    event_name = "pipeline.exit.controlled_error",
                    pipeline_id = %state.pipeline_id,
                    trace_id = %input.trace_id,
                    correlation_id = interface.correlation_id(),
                    error = %interface,
                    "run ended with a controlled error"
                );
                OrchestratorOutput {
                    message: interface.user_message().to_string(),
                    clarification_request: None,
                    pricing_options: None,
                    session_state: None,
                    agent_state: None,
                    metadata: state.metadata(
                        RunOutcome::ControlledError,
                        RiskLevel::Low,
                        None,
                        threshold,
                    ),
                    steps: state.steps,
                }
            }
        }
    }

    async fn drive(
        &self,
        input: &OrchestratorInput,
        state: &mut RunState,
    ) -> Result<Exit, OrchestratorError> {
        let pipeline_id = state.pipeline_id.clone();
        let runner = StageRunner::new(
            self.chat.as_ref(),
            self.resolver.as_ref(),
            self.settings,
            &pipeline_id,
            &input.trace_id,
        );
        let stages = Stages::new(&runner, input);

        let classification = stages.classify(&mut state.trace).await?;
        state.classification = classification.clone();

        let decomposition = stages.decompose(&classification, &mut state.trace).await?;
        let task_plan =
            stages.plan_tasks(&classification, &decomposition.subtasks, &mut state.trace).await?;

        let catalog = self.tools.catalog().for_domain(classification.domain);
        if catalog.is_empty() {
            return Ok(Exit::Clarification(NO_TOOLS_MESSAGE.to_string()));
        }

        for task in &task_plan.tasks {
            let plan =
                stages.plan_steps(&classification, task, &catalog, &mut state.trace).await?;

            for step in &plan.steps {
                let direct = if self.direct_path_enabled {
                    direct_path::choose(&classification, step, plan.steps.len(), &catalog, input)
                } else {
                    None
                };

                let (spec, call): (ToolSpec, ToolCall) = match direct {
                    Some(decision) => {
                        state.escalate(decision.spec.risk_level);
                        direct_path::record_bypass(&mut state.trace);
                        info!(
                            event_name = "pipeline.direct_path.selected",
                            pipeline_id = %pipeline_id,
                            trace_id = %input.trace_id,
                            task_id = %task.id,
                            step_id = %step.id,
                            tool = %decision.spec.name,
                            reason = %decision.reason,
                            "direct tool path selected"
                        );
                        (decision.spec, decision.call)
                    }
                    None => {
                        let analysis = stages
                            .analyze_tool(&classification, step, &catalog, &mut state.trace)
                            .await?;
                        state.escalate(analysis.risk_level);

                        if analysis.requires_clarification || !analysis.missing_data.is_empty() {
                            let question = analysis.clarification_question.unwrap_or_else(|| {
                                format!(
                                    "I need the following details to proceed: {}",
                                    analysis.missing_data.join(", ")
                                )
                            });
                            return Ok(Exit::Clarification(question));
                        }

                        let Some(selected) = catalog
                            .get(&analysis.recommended_tool)
                            .filter(|tool| step.has_candidate(&tool.name))
                            .cloned()
                        else {
                            return Ok(Exit::Clarification(format!(
                                "The suggested tool ({}) is not allowed for this step. Tell me more about the result you expect.",
                                analysis.recommended_tool
                            )));
                        };
                        state.escalate(selected.risk_level);

                        let draft = stages
                            .draft_arguments(
                                &classification,
                                step,
                                &analysis,
                                &selected,
                                &mut state.trace,
                            )
                            .await?;
                        if draft.tool != selected.name {
                            return Ok(Exit::Clarification(format!(
                                "I could not prepare consistent arguments for {}. Could you rephrase the request?",
                                selected.name
                            )));
                        }

                        let confirmation = stages
                            .confirm_call(&classification, &draft, &selected, &mut state.trace)
                            .await?;
                        if confirmation.tool != selected.name {
                            return Ok(Exit::Clarification(format!(
                                "The final command does not match tool {}. Let's try again with more detail.",
                                selected.name
                            )));
                        }

                        let command = stages
                            .build_command(
                                &classification,
                                &confirmation,
                                &selected,
                                &mut state.trace,
                            )
                            .await?;
                        if command.tool != selected.name {
                            return Ok(Exit::Clarification(format!(
                                "The normalized command is not consistent with {}.",
                                selected.name
                            )));
                        }

                        let call = ToolCall::new(selected.name.clone(), command.args);
                        (selected, call)
                    }
                };

                let started = Instant::now();
                let context = SafetyContext {
                    domain: classification.domain,
                    channel: classification.channel,
                    workspace_id: input.workspace_id.as_deref(),
                };
                let sanitized = match safety::evaluate(&spec, &call, &context) {
                    SafetyDecision::Allow { sanitized_call } => {
                        state.trace.push(StageTraceEntry::policy(
                            Stage::PolicyToolSafety,
                            true,
                            elapsed_ms(started),
                            None,
                        ));
                        sanitized_call
                    }
                    SafetyDecision::Reject(rejection) => {
                        state.trace.push(StageTraceEntry::policy(
                            Stage::PolicyToolSafety,
                            false,
                            elapsed_ms(started),
                            Some("clarification_required"),
                        ));
                        info!(
                            event_name = "pipeline.policy.safety_rejected",
                            pipeline_id = %pipeline_id,
                            tool = %spec.name,
                            code = rejection.code.as_str(),
                            "tool call rejected by safety policy"
                        );
                        return Ok(Exit::Clarification(rejection.message));
                    }
                };

                let started = Instant::now();
                let approval =
                    self.approval.evaluate(&spec, &sanitized, &input.message, self.clock.now());
                state.trace.push(StageTraceEntry::policy(
                    Stage::PolicyApproval,
                    approval.approved,
                    elapsed_ms(started),
                    (!approval.approved).then_some("clarification_required"),
                ));
                state.escalate(approval.risk_level);
                if approval.is_pending() {
                    if let Some(payload) = approval.payload {
                        return Ok(Exit::Approval(payload));
                    }
                }

                let tool_context = ToolContext {
                    input,
                    classification: &classification,
                    pipeline_id: &pipeline_id,
                    task_id: &task.id,
                    step_id: &step.id,
                };
                let started = Instant::now();
                let result = match self.tools.execute(&sanitized, &tool_context).await {
                    Ok(result) => result,
                    Err(failure) => {
                        state.trace.push(StageTraceEntry::policy(
                            Stage::ToolExecutor,
                            false,
                            elapsed_ms(started),
                            Some("stage_failed"),
                        ));
                        return Err(OrchestratorError::ToolExecution(format!("{failure:#}")));
                    }
                };
                state.trace.push(StageTraceEntry::policy(
                    Stage::ToolExecutor,
                    result.success,
                    elapsed_ms(started),
                    (!result.success).then_some("stage_failed"),
                ));

                state.steps.push(StepResult {
                    success: result.success,
                    tool: sanitized.name.clone(),
                    task_id: task.id.clone(),
                    step_id: step.id.clone(),
                    message: result.message.clone(),
                    result: result.result.clone(),
                    error: result.error.clone(),
                    risk_level: state.risk_level,
                });
                state.execution = mem::take(&mut state.execution).merge(&result);
            }
        }

        let aggregation = stages
            .aggregate(
                &classification,
                AggregationInput {
                    tool_plan_id: &state.tool_plan_id,
                    steps: &state.steps,
                    approval_required: false,
                    execution: &state.execution,
                },
                &mut state.trace,
            )
            .await?;
        let finalization = stages.finalize(&classification, &aggregation, &mut state.trace).await?;

        Ok(Exit::Completed { aggregation, finalization })
    }
}

fn merge_states(
    base: Option<Map<String, Value>>,
    update: Option<&Map<String, Value>>,
) -> Map<String, Value> {
    let base = base.unwrap_or_default();
    match update {
        Some(update) => shallow_merge(base, update),
        None => base,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
