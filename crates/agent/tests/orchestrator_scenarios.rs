use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use stagewise_agent::{Orchestrator, ScriptedModelChat, Tool, ToolContext, ToolRegistry};
use stagewise_core::clock::FixedClock;
use stagewise_core::domain::routing::{Domain, RiskLevel};
use stagewise_core::domain::tool::{
    PropertyType, Tenancy, ToolCall, ToolExecutionPolicy, ToolProperty, ToolSpec,
};
use stagewise_core::models::ModelRole;
use stagewise_core::pipeline::{OrchestratorInput, RunOutcome, ToolExecutionResult};
use stagewise_core::trace::{Stage, DIRECT_PATH_MODEL};

const NOW_MS: i64 = 1_771_675_200_000;

struct CannedTool {
    spec: ToolSpec,
    reply: Option<ToolExecutionResult>,
    calls: Arc<AtomicUsize>,
}

impl CannedTool {
    fn new(spec: ToolSpec, reply: ToolExecutionResult) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (Self { spec, reply: Some(reply), calls: Arc::clone(&calls) }, calls)
    }

    fn broken(spec: ToolSpec) -> Self {
        Self { spec, reply: None, calls: Arc::new(AtomicUsize::new(0)) }
    }
}

#[async_trait]
impl Tool for CannedTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn execute(
        &self,
        _call: &ToolCall,
        _context: &ToolContext<'_>,
    ) -> Result<ToolExecutionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reply.clone().ok_or_else(|| anyhow!("connection reset by carrier gateway"))
    }
}

fn spec(name: &str, domain: Domain, required: &[&str], risk_level: RiskLevel) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: format!("{name} tool"),
        properties: required
            .iter()
            .map(|key| {
                (
                    key.to_string(),
                    ToolProperty { kind: PropertyType::String, ..ToolProperty::default() },
                )
            })
            .collect::<BTreeMap<_, _>>(),
        required: required.iter().map(|key| key.to_string()).collect(),
        domains: vec![domain],
        channels: Vec::new(),
        risk_level,
        requires_approval: false,
        policy: ToolExecutionPolicy::default(),
    }
}

fn classification(domain: &str, channel: &str, intent_id: &str, confidence: u8) -> String {
    json!({
        "domain": domain,
        "channel": channel,
        "intentId": intent_id,
        "reason": "matched keywords",
        "confidence": confidence,
    })
    .to_string()
}

/// Replies for the routing stages of a single task with a single step.
fn routed_chat(
    domain: &str,
    channel: &str,
    intent_id: &str,
    confidence: u8,
    candidates: &[&str],
) -> ScriptedModelChat {
    ScriptedModelChat::new()
        .with_reply(ModelRole::RequestManager, classification(domain, channel, intent_id, confidence))
        .with_reply(
            ModelRole::DomainDecomposer,
            json!({"subtasks": [{"goal": "handle the request"}]}).to_string(),
        )
        .with_reply(
            ModelRole::TaskPlanner,
            json!({"tasks": [{"domain": domain, "intentId": intent_id, "goal": "handle the request"}]})
                .to_string(),
        )
        .with_reply(
            ModelRole::Planner,
            json!({"steps": [{"goal": "run the tool", "toolCandidates": candidates}]}).to_string(),
        )
}

fn with_tool_selection(chat: ScriptedModelChat, tool: &str, args: Value) -> ScriptedModelChat {
    chat.with_reply(
        ModelRole::ToolAnalysis,
        json!({"recommendedTool": tool, "riskLevel": "low", "missingData": [], "requiresClarification": false})
            .to_string(),
    )
    .with_reply(ModelRole::ToolArgument, json!({"tool": tool, "args": args}).to_string())
    .with_reply(
        ModelRole::ToolCaller,
        json!({"tool": tool, "args": args, "reason": "arguments complete"}).to_string(),
    )
    .with_reply(ModelRole::CommandBuilder, json!({"tool": tool, "args": args}).to_string())
}

fn with_reply_stages(chat: ScriptedModelChat, aggregation: Value, final_message: &str) -> ScriptedModelChat {
    chat.with_reply(ModelRole::Aggregator, aggregation.to_string())
        .with_reply(ModelRole::Finalizer, json!({"message": final_message}).to_string())
}

fn orchestrator(chat: &Arc<ScriptedModelChat>, registry: ToolRegistry) -> Orchestrator {
    Orchestrator::new(chat.clone(), Arc::new(registry))
        .with_clock(Arc::new(FixedClock::at_millis(NOW_MS)))
}

fn input(message: &str) -> OrchestratorInput {
    OrchestratorInput::new(message, "0f8e2a71-5b4c-4d11-9c0e-3a1f7e6b2d90", "trace-42")
}

#[tokio::test]
async fn high_confidence_single_step_takes_direct_path() {
    let (tool, tool_calls) = CannedTool::new(
        spec("shipment_quote_orchestrated", Domain::Quote, &[], RiskLevel::Low),
        ToolExecutionResult {
            success: true,
            message: Some("2 rates found".to_string()),
            pricing_options: Some(vec![json!({"courier": "BRT", "price": 7.9})]),
            ..ToolExecutionResult::default()
        },
    );
    let chat = Arc::new(with_reply_stages(
        routed_chat("quote", "quote", "quote.create", 95, &["shipment_quote_orchestrated"]),
        json!({"summary": "two rates", "message": "Here are the rates"}),
        "Here are 2 rates for your parcel.",
    ));

    let output = orchestrator(&chat, ToolRegistry::new().with_tool(tool))
        .run(&input("Mi fai un preventivo per 2.4 kg verso 00100 Roma?"))
        .await;

    assert_eq!(output.metadata.outcome, RunOutcome::Completed);
    assert_eq!(output.message, "Here are 2 rates for your parcel.");
    assert_eq!(output.clarification_request, None);
    assert_eq!(output.pricing_options.as_ref().map(Vec::len), Some(1));
    assert_eq!(output.steps.len(), 1);
    assert!(output.steps[0].success);
    assert_eq!(tool_calls.load(Ordering::SeqCst), 1);

    for role in [
        ModelRole::ToolAnalysis,
        ModelRole::ToolArgument,
        ModelRole::ToolCaller,
        ModelRole::CommandBuilder,
    ] {
        assert_eq!(chat.calls_for(role), 0, "{role} must be skipped");
    }

    let entries = &output.metadata.stage_trace.entries;
    let bypassed = entries.iter().filter(|entry| entry.model == DIRECT_PATH_MODEL).collect::<Vec<_>>();
    assert_eq!(bypassed.len(), 4);
    assert!(bypassed.iter().all(|entry| entry.success && entry.duration_ms == 0));
    assert_eq!(
        bypassed.iter().map(|entry| entry.stage).collect::<Vec<_>>(),
        vec![Stage::ToolAnalysis, Stage::ToolArgument, Stage::ToolCaller, Stage::CommandBuilder]
    );
    assert_eq!(output.metadata.stage_trace.last_stage, Stage::Finalizer);
    assert_eq!(output.metadata.flow_id, "orch.quote.quote.create");
    assert_eq!(output.metadata.pipeline_id, "pipeline_1771675200000_0f8e2a71");
    assert_eq!(output.metadata.tool_plan_id.as_deref(), Some("toolplan_1771675200000_0f8e2a71"));
}

#[tokio::test]
async fn disabled_direct_path_runs_tool_selection_stages() {
    let (tool, _) = CannedTool::new(
        spec("shipment_quote_orchestrated", Domain::Quote, &[], RiskLevel::Low),
        ToolExecutionResult::succeeded(json!({"rates": 2})),
    );
    let chat = Arc::new(with_reply_stages(
        with_tool_selection(
            routed_chat("quote", "quote", "quote.create", 95, &["shipment_quote_orchestrated"]),
            "shipment_quote_orchestrated",
            json!({}),
        ),
        json!({"summary": "done"}),
        "Done.",
    ));

    let output = orchestrator(&chat, ToolRegistry::new().with_tool(tool))
        .with_direct_path(false)
        .run(&input("quote 2kg to Rome"))
        .await;

    assert_eq!(output.metadata.outcome, RunOutcome::Completed);
    assert_eq!(chat.calls_for(ModelRole::ToolAnalysis), 1);
    assert_eq!(chat.calls_for(ModelRole::CommandBuilder), 1);
    assert!(output
        .metadata
        .stage_trace
        .entries
        .iter()
        .all(|entry| entry.model != DIRECT_PATH_MODEL));
}

#[tokio::test]
async fn missing_tracking_code_asks_for_clarification() {
    let (tool, tool_calls) = CannedTool::new(
        spec("support_tracking", Domain::Support, &["tracking_code"], RiskLevel::Low),
        ToolExecutionResult::succeeded(json!({})),
    );
    let chat = Arc::new(
        routed_chat("support", "support", "support.tracking", 92, &["support_tracking"]).with_reply(
            ModelRole::ToolAnalysis,
            json!({
                "recommendedTool": "support_tracking",
                "riskLevel": "low",
                "missingData": ["tracking_id"],
                "requiresClarification": true,
                "clarificationQuestion": "Indicami il codice tracking completo.",
            })
            .to_string(),
        ),
    );

    let output = orchestrator(&chat, ToolRegistry::new().with_tool(tool))
        .run(&input("dove si trova la mia spedizione?"))
        .await;

    assert_eq!(output.metadata.outcome, RunOutcome::Clarification);
    assert_eq!(output.message, "Indicami il codice tracking completo.");
    assert_eq!(output.clarification_request.as_deref(), Some(output.message.as_str()));
    assert!(!output.metadata.approval_required);
    assert_eq!(output.metadata.risk_level, RiskLevel::Low);
    assert_eq!(chat.calls_for(ModelRole::ToolArgument), 0);
    assert_eq!(chat.calls_for(ModelRole::Finalizer), 0);
    assert_eq!(tool_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn critical_tool_pauses_for_approval() {
    let (tool, tool_calls) = CannedTool::new(
        spec("crm_delete_contact", Domain::Crm, &["contact_id"], RiskLevel::Critical),
        ToolExecutionResult::succeeded(json!({"deleted": true})),
    );
    let chat = Arc::new(with_tool_selection(
        routed_chat("crm", "crm", "crm.delete_contact", 90, &["crm_delete_contact"]),
        "crm_delete_contact",
        json!({"contact_id": "c-42"}),
    ));

    let output = orchestrator(&chat, ToolRegistry::new().with_tool(tool))
        .run(&input("please delete contact c-42"))
        .await;

    assert_eq!(output.metadata.outcome, RunOutcome::ApprovalRequired);
    assert!(output.metadata.approval_required);
    assert_eq!(output.metadata.risk_level, RiskLevel::Critical);
    assert_eq!(tool_calls.load(Ordering::SeqCst), 0);
    assert!(output.steps.is_empty());

    let payload = output.metadata.approval_payload.clone().expect("approval payload");
    assert_eq!(payload.id.0, "approval_1771675200000_crm_delete_contact");
    assert_eq!(payload.tool, "crm_delete_contact");
    assert_eq!(payload.args.get("contact_id"), Some(&json!("c-42")));
    assert_eq!((payload.expires_at - payload.created_at).num_seconds(), 300);
    assert_eq!(output.message, payload.description);
    assert_eq!(output.clarification_request.as_deref(), Some(payload.description.as_str()));

    let pending = output
        .agent_state
        .as_ref()
        .and_then(|state| state.get("pendingAction"))
        .cloned()
        .expect("pending action");
    assert_eq!(pending, serde_json::to_value(&payload).expect("serialize payload"));

    let approval_entry = output
        .metadata
        .stage_trace
        .entries
        .iter()
        .find(|entry| entry.stage == Stage::PolicyApproval)
        .expect("approval trace entry");
    assert!(!approval_entry.success);
    assert_eq!(approval_entry.error_code.as_deref(), Some("clarification_required"));
    assert_eq!(chat.calls_for(ModelRole::Aggregator), 0);
}

#[tokio::test]
async fn confirmation_message_executes_critical_tool() {
    let (tool, tool_calls) = CannedTool::new(
        spec("crm_delete_contact", Domain::Crm, &["contact_id"], RiskLevel::Critical),
        ToolExecutionResult::succeeded(json!({"deleted": true})),
    );
    let chat = Arc::new(with_reply_stages(
        with_tool_selection(
            routed_chat("crm", "crm", "crm.delete_contact", 90, &["crm_delete_contact"]),
            "crm_delete_contact",
            json!({"contact_id": "c-42"}),
        ),
        json!({"summary": "deleted"}),
        "Contact c-42 deleted.",
    ));

    let output = orchestrator(&chat, ToolRegistry::new().with_tool(tool))
        .run(&input("confirm, delete contact c-42"))
        .await;

    assert_eq!(output.metadata.outcome, RunOutcome::Completed);
    assert_eq!(output.message, "Contact c-42 deleted.");
    assert_eq!(output.metadata.risk_level, RiskLevel::Critical);
    assert_eq!(output.steps[0].risk_level, RiskLevel::Critical);
    assert_eq!(tool_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn classifier_timeouts_end_in_service_unavailable() {
    let chat = Arc::new(
        ScriptedModelChat::new()
            .with_error(ModelRole::RequestManager, anyhow!("request timed out after 30s"))
            .with_error(ModelRole::RequestManager, anyhow!("request timed out after 30s")),
    );

    let output = orchestrator(&chat, ToolRegistry::new()).run(&input("hello")).await;

    assert_eq!(output.metadata.outcome, RunOutcome::ControlledError);
    assert_eq!(
        output.message,
        "The AI service is temporarily unavailable. Please try again in a few minutes."
    );
    assert_eq!(output.clarification_request, None);
    assert_eq!(chat.calls_for(ModelRole::RequestManager), 2);
    assert_eq!(chat.calls_for(ModelRole::DomainDecomposer), 0);
    assert_eq!(output.metadata.domain, Domain::Support);
    assert_eq!(output.metadata.stage_trace.entries.len(), 2);
    assert!(output
        .metadata
        .stage_trace
        .entries
        .iter()
        .all(|entry| entry.error_code.as_deref() == Some("model_unavailable")));
}

#[tokio::test]
async fn invalid_contract_everywhere_ends_in_generic_error() {
    let chat = Arc::new(ScriptedModelChat::new().with_default_reply("I think it's a quote"));

    let output = orchestrator(&chat, ToolRegistry::new()).run(&input("hello")).await;

    assert_eq!(output.metadata.outcome, RunOutcome::ControlledError);
    assert_eq!(
        output.message,
        "Sorry, something went wrong while handling your request. Please try again shortly."
    );
}

#[tokio::test]
async fn empty_domain_catalog_asks_for_a_more_specific_goal() {
    let (tool, _) = CannedTool::new(
        spec("shipment_quote_orchestrated", Domain::Quote, &[], RiskLevel::Low),
        ToolExecutionResult::succeeded(json!({})),
    );
    let chat = Arc::new(routed_chat("outreach", "outreach", "outreach.campaign", 88, &["anything"]));

    let output = orchestrator(&chat, ToolRegistry::new().with_tool(tool))
        .run(&input("send a campaign to my customers"))
        .await;

    assert_eq!(output.metadata.outcome, RunOutcome::Clarification);
    assert!(output.message.contains("no tools available"));
    assert_eq!(chat.calls_for(ModelRole::Planner), 0);
}

#[tokio::test]
async fn candidate_missing_from_catalog_asks_for_clarification() {
    let (tool, _) = CannedTool::new(
        spec("support_tracking", Domain::Support, &[], RiskLevel::Low),
        ToolExecutionResult::succeeded(json!({})),
    );
    let chat = Arc::new(
        routed_chat("support", "support", "support.refund", 70, &["support_refund"]).with_reply(
            ModelRole::ToolAnalysis,
            json!({"recommendedTool": "support_refund", "riskLevel": "medium", "missingData": []})
                .to_string(),
        ),
    );

    let output = orchestrator(&chat, ToolRegistry::new().with_tool(tool))
        .run(&input("I want a refund"))
        .await;

    assert_eq!(output.metadata.outcome, RunOutcome::Clarification);
    assert!(output.message.contains("support_refund"));
    assert_eq!(chat.calls_for(ModelRole::ToolArgument), 0);
    assert_eq!(output.metadata.risk_level, RiskLevel::Low);
}

#[tokio::test]
async fn drifting_tool_name_between_stages_asks_for_clarification() {
    let (tool, tool_calls) = CannedTool::new(
        spec("support_tracking", Domain::Support, &[], RiskLevel::Low),
        ToolExecutionResult::succeeded(json!({})),
    );
    let chat = Arc::new(
        routed_chat("support", "support", "support.tracking", 70, &["support_tracking"])
            .with_reply(
                ModelRole::ToolAnalysis,
                json!({"recommendedTool": "support_tracking", "missingData": []}).to_string(),
            )
            .with_reply(
                ModelRole::ToolArgument,
                json!({"tool": "support_ticket", "args": {}}).to_string(),
            ),
    );

    let output = orchestrator(&chat, ToolRegistry::new().with_tool(tool))
        .run(&input("where is my parcel"))
        .await;

    assert_eq!(output.metadata.outcome, RunOutcome::Clarification);
    assert!(output.message.contains("support_tracking"));
    assert_eq!(chat.calls_for(ModelRole::ToolCaller), 0);
    assert_eq!(tool_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn workspace_scoped_tool_without_workspace_is_rejected() {
    let mut scoped = spec("listini_update", Domain::Listini, &["price_list_id"], RiskLevel::Medium);
    scoped.policy = ToolExecutionPolicy { tenancy: Tenancy::WorkspaceRequired, ..ToolExecutionPolicy::default() };
    let (tool, tool_calls) = CannedTool::new(scoped, ToolExecutionResult::succeeded(json!({})));
    let chat = Arc::new(with_tool_selection(
        routed_chat("listini", "listini", "listini.update", 60, &["listini_update"]),
        "listini_update",
        json!({"price_list_id": "pl-1", "workspaceId": "ws-other"}),
    ));

    let output = orchestrator(&chat, ToolRegistry::new().with_tool(tool))
        .run(&input("update price list pl-1"))
        .await;

    assert_eq!(output.metadata.outcome, RunOutcome::Clarification);
    assert_eq!(output.message, "Select a workspace before running this action.");
    assert_eq!(tool_calls.load(Ordering::SeqCst), 0);
    let safety = output
        .metadata
        .stage_trace
        .entries
        .iter()
        .find(|entry| entry.stage == Stage::PolicyToolSafety)
        .expect("safety trace entry");
    assert!(!safety.success);
    assert_eq!(safety.error_code.as_deref(), Some("clarification_required"));
}

#[tokio::test]
async fn failed_tool_step_is_recorded_and_run_completes() {
    let (tool, _) = CannedTool::new(
        spec("support_tracking", Domain::Support, &["tracking_code"], RiskLevel::Low),
        ToolExecutionResult::failed("carrier offline"),
    );
    let chat = Arc::new(with_reply_stages(
        with_tool_selection(
            routed_chat("support", "support", "support.tracking", 70, &["support_tracking"]),
            "support_tracking",
            json!({"tracking_code": "BRT123"}),
        ),
        json!({"summary": "tracking failed", "sessionState": {"lastTracking": "BRT123"}}),
        "The carrier is not responding right now.",
    ));

    let output = orchestrator(&chat, ToolRegistry::new().with_tool(tool))
        .run(&input("track BRT123"))
        .await;

    assert_eq!(output.metadata.outcome, RunOutcome::Completed);
    assert_eq!(output.steps.len(), 1);
    assert!(!output.steps[0].success);
    assert_eq!(output.steps[0].error.as_deref(), Some("carrier offline"));
    assert_eq!(
        output.session_state.as_ref().and_then(|state| state.get("lastTracking")),
        Some(&json!("BRT123"))
    );
    let executor = output
        .metadata
        .stage_trace
        .entries
        .iter()
        .find(|entry| entry.stage == Stage::ToolExecutor)
        .expect("executor trace entry");
    assert!(!executor.success);
    assert_eq!(executor.error_code.as_deref(), Some("stage_failed"));
}

#[tokio::test]
async fn executor_fault_ends_in_generic_error() {
    let chat = Arc::new(with_tool_selection(
        routed_chat("support", "support", "support.tracking", 70, &["support_tracking"]),
        "support_tracking",
        json!({}),
    ));
    let tool = CannedTool::broken(spec("support_tracking", Domain::Support, &[], RiskLevel::Low));

    let output = orchestrator(&chat, ToolRegistry::new().with_tool(tool))
        .run(&input("track my parcel"))
        .await;

    assert_eq!(output.metadata.outcome, RunOutcome::ControlledError);
    assert!(output.message.starts_with("Sorry, something went wrong"));
    assert_eq!(chat.calls_for(ModelRole::Aggregator), 0);
}

#[tokio::test]
async fn aggregator_clarification_wins_over_final_message() {
    let (tool, _) = CannedTool::new(
        spec("support_tracking", Domain::Support, &[], RiskLevel::Low),
        ToolExecutionResult {
            success: true,
            agent_state: Some(
                json!({"lastTool": "support_tracking"}).as_object().cloned().unwrap_or_default(),
            ),
            ..ToolExecutionResult::default()
        },
    );
    let chat = Arc::new(with_reply_stages(
        with_tool_selection(
            routed_chat("support", "support", "support.tracking", 70, &["support_tracking"]),
            "support_tracking",
            json!({}),
        ),
        json!({
            "summary": "two parcels match",
            "clarificationRequired": true,
            "clarificationQuestion": "Which of your two parcels do you mean?",
            "agentState": {"candidates": 2},
        }),
        "Your parcel is in transit.",
    ));

    let output = orchestrator(&chat, ToolRegistry::new().with_tool(tool))
        .run(&input("where is my parcel"))
        .await;

    assert_eq!(output.metadata.outcome, RunOutcome::Completed);
    assert_eq!(output.message, "Which of your two parcels do you mean?");
    assert_eq!(output.clarification_request.as_deref(), Some(output.message.as_str()));
    let agent_state = output.agent_state.expect("agent state");
    assert_eq!(agent_state.get("lastTool"), Some(&json!("support_tracking")));
    assert_eq!(agent_state.get("candidates"), Some(&json!(2)));
}

#[tokio::test]
async fn approval_reports_worst_risk_seen_during_run() {
    let (tool, tool_calls) = CannedTool::new(
        spec("crm_merge_contacts", Domain::Crm, &["contact_id"], RiskLevel::High),
        ToolExecutionResult::succeeded(json!({"merged": true})),
    );
    let args = json!({"contact_id": "c-42"});
    let chat = Arc::new(
        routed_chat("crm", "crm", "crm.merge_contacts", 90, &["crm_merge_contacts"])
            .with_reply(
                ModelRole::ToolAnalysis,
                json!({
                    "recommendedTool": "crm_merge_contacts",
                    "riskLevel": "critical",
                    "missingData": [],
                    "requiresClarification": false,
                })
                .to_string(),
            )
            .with_reply(
                ModelRole::ToolArgument,
                json!({"tool": "crm_merge_contacts", "args": args}).to_string(),
            )
            .with_reply(
                ModelRole::ToolCaller,
                json!({"tool": "crm_merge_contacts", "args": args, "reason": "ids known"}).to_string(),
            )
            .with_reply(
                ModelRole::CommandBuilder,
                json!({"tool": "crm_merge_contacts", "args": args}).to_string(),
            ),
    );

    let output = orchestrator(&chat, ToolRegistry::new().with_tool(tool))
        .run(&input("merge contact c-42 into its duplicate"))
        .await;

    assert_eq!(output.metadata.outcome, RunOutcome::ApprovalRequired);
    assert_eq!(output.metadata.risk_level, RiskLevel::Critical);
    let payload = output.metadata.approval_payload.as_ref().expect("approval payload");
    assert_eq!(payload.risk_level, RiskLevel::High);
    assert_eq!(tool_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn multi_task_run_executes_every_step_and_merges_state() {
    let (rates, rates_calls) = CannedTool::new(
        spec("quote_rates_lookup", Domain::Quote, &[], RiskLevel::Low),
        ToolExecutionResult {
            success: true,
            agent_state: json!({"a": 1}).as_object().cloned(),
            ..ToolExecutionResult::default()
        },
    );
    let (surcharges, surcharge_calls) = CannedTool::new(
        spec("quote_surcharge_lookup", Domain::Quote, &[], RiskLevel::Medium),
        ToolExecutionResult {
            success: true,
            agent_state: json!({"b": 2}).as_object().cloned(),
            ..ToolExecutionResult::default()
        },
    );
    let (orchestrated, orchestrated_calls) = CannedTool::new(
        spec("shipment_quote_orchestrated", Domain::Quote, &[], RiskLevel::Low),
        ToolExecutionResult::succeeded(json!({"rates": 3})),
    );

    let chat = ScriptedModelChat::new()
        .with_reply(ModelRole::RequestManager, classification("quote", "quote", "quote.create", 95))
        .with_reply(
            ModelRole::DomainDecomposer,
            json!({"subtasks": [{"goal": "collect pricing inputs"}, {"goal": "compare couriers"}]})
                .to_string(),
        )
        .with_reply(
            ModelRole::TaskPlanner,
            json!({"tasks": [
                {"domain": "quote", "intentId": "quote.create", "goal": "collect pricing inputs"},
                {"domain": "quote", "intentId": "quote.create", "goal": "compare couriers"},
            ]})
            .to_string(),
        )
        .with_reply(
            ModelRole::Planner,
            json!({"steps": [
                {"goal": "look up base rates", "toolCandidates": ["quote_rates_lookup"]},
                {"goal": "look up surcharges", "toolCandidates": ["quote_surcharge_lookup"]},
            ]})
            .to_string(),
        )
        .with_reply(
            ModelRole::Planner,
            json!({"steps": [{"goal": "compare couriers", "toolCandidates": ["shipment_quote_orchestrated"]}]})
                .to_string(),
        );
    let chat = with_tool_selection(chat, "quote_rates_lookup", json!({}));
    let chat = with_tool_selection(chat, "quote_surcharge_lookup", json!({}));
    let chat = Arc::new(with_reply_stages(chat, json!({"summary": "three lookups"}), "Rates ready."));

    let registry = ToolRegistry::new().with_tool(rates).with_tool(surcharges).with_tool(orchestrated);
    let output = orchestrator(&chat, registry)
        .run(&input("quote 3kg Milan to Rome with surcharges"))
        .await;

    assert_eq!(output.metadata.outcome, RunOutcome::Completed);
    assert_eq!(output.message, "Rates ready.");
    assert_eq!(
        output
            .steps
            .iter()
            .map(|step| (step.task_id.as_str(), step.step_id.as_str(), step.tool.as_str()))
            .collect::<Vec<_>>(),
        vec![
            ("task_1", "task_1_step_1", "quote_rates_lookup"),
            ("task_1", "task_1_step_2", "quote_surcharge_lookup"),
            ("task_2", "task_2_step_1", "shipment_quote_orchestrated"),
        ]
    );
    assert!(output.steps.iter().all(|step| step.success));
    for calls in [rates_calls, surcharge_calls, orchestrated_calls] {
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    assert_eq!(chat.calls_for(ModelRole::Planner), 2);
    assert_eq!(chat.calls_for(ModelRole::ToolAnalysis), 2);
    assert_eq!(chat.calls_for(ModelRole::CommandBuilder), 2);
    let bypassed = output
        .metadata
        .stage_trace
        .entries
        .iter()
        .filter(|entry| entry.model == DIRECT_PATH_MODEL)
        .count();
    assert_eq!(bypassed, 4, "only the single-step second task takes the direct path");

    let agent_state = output.agent_state.as_ref().expect("merged agent state");
    assert_eq!(agent_state.get("a"), Some(&json!(1)));
    assert_eq!(agent_state.get("b"), Some(&json!(2)));
    assert_eq!(output.metadata.risk_level, RiskLevel::Medium);
}
