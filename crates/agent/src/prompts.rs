//! System instructions for each model role.

use stagewise_core::domain::routing::Domain;
use stagewise_core::models::ModelRole;

fn domain_context(domain: Domain) -> &'static str {
    match domain {
        Domain::Quote => "Shipment quotes and courier price comparison.",
        Domain::Shipment => "Creating and operating shipments.",
        Domain::Support => "Customer support on tracking, held parcels, refunds and anomalies.",
        Domain::Crm => "Sales pipeline, leads and prospects, notes and statuses.",
        Domain::Outreach => "Outreach sequences, channels, enrollment and metrics.",
        Domain::Listini => "Price lists, margins, supplier costs and price comparisons.",
        Domain::Mentor => "Internal technical and operational mentoring.",
        Domain::Debug => "Error diagnostics and operational troubleshooting.",
        Domain::Explain => "Explanations of business processes and operational policies.",
    }
}

fn base_guardrails(domain: Domain) -> String {
    [
        format!("Current domain: {domain}."),
        format!("Domain context: {}", domain_context(domain)),
        "Reply with valid JSON only, no markdown and no extra text.".to_string(),
        "Never invent missing data: report it through the clarification fields of the contract."
            .to_string(),
        "Use only business tools listed in the catalog you receive.".to_string(),
    ]
    .join("\n")
}

const REQUEST_MANAGER_ROUTING: &str = "\
Routing policy, in order of evidence:
1) quote: estimate, price, cost, rate, courier comparison, weight/zip/city/service data.
2) shipment: create shipment, confirm booking, generate label, buy shipment.
3) support: problems on an existing shipment: stuck tracking, held parcel, delay, complaint, refund.
4) crm: leads, prospects, sales notes, pipeline, commercial follow-up.
5) outreach: campaigns and sequences, enrollment, outreach channels and metrics.
6) listini: price lists, margins, supplier costs, price configuration.
7) mentor: internal operational or strategic coaching.
8) debug: technical error, stack trace or log analysis.
9) explain: general explanations of processes and business logic.

Tie-break rules:
- Explicit pricing intent means domain=quote even when the user asks for help.
- Use support only for an existing shipment issue, never for a new estimate.

Channel mapping is strict:
quote->quote, shipment->create_shipment, support->support, crm->crm, outreach->outreach,
listini->listini, mentor->mentor, debug->debug, explain->explain.

Intent ids are lowercase and dotted: <domain>.<action>.<object>, e.g. quote.create.estimate.";

const REQUEST_MANAGER_EXAMPLES: &str = r#"Example input: "Mi fai un preventivo per 2.4 kg verso 00100 Roma?"
Example output: {"domain":"quote","channel":"quote","intentId":"quote.create.estimate","reason":"Explicit quote request with weight and zip code.","confidence":95}
Example input: "The tracking for shipment 123 has been stuck since yesterday, can you help?"
Example output: {"domain":"support","channel":"support","intentId":"support.resolve.tracking_issue","reason":"Problem on an existing shipment.","confidence":93}
Example input: "Confirm and create the shipment we prepared."
Example output: {"domain":"shipment","channel":"create_shipment","intentId":"shipment.create.confirmed_booking","reason":"Operational shipment creation request.","confidence":94}"#;

/// Extra rules injected when a classification attempt has already failed.
pub const REQUEST_MANAGER_DISAMBIGUATION: &str = "\
Disambiguation rules (mandatory):
- outreach vs crm: enrolling into a sequence or campaign is outreach, not crm.
- listini vs quote: supplier cost, selling price, margin or price-list comparison is listini.
- mentor vs explain: questions about the assistant's internal architecture are mentor.
- explain vs listini: conceptual \"how is it calculated\" questions without fetching a record are explain.
- a greeting-only message is support with a greeting intent.
- channel MUST equal the mapped channel of the chosen domain.";

const TOOL_ANALYSIS_GUIDE: &str = "\
Tool selection policy:
- Choose only from step.toolCandidates; recommendedTool must match one candidate exactly.
- Prefer the domain orchestrated tool when present.
- If several tools reach the goal, prefer the lowest-risk one.
- Do not generate arguments in this stage.

Clarification policy:
- If required data is missing, set requiresClarification=true, list missingData and ask a concrete clarificationQuestion.
- If nothing is missing, requiresClarification=false and missingData=[].";

const TOOL_ANALYSIS_EXAMPLES: &str = r#"Example input: step.toolCandidates=["track_shipment","diagnose_shipment_issue"], tracking status asked without a tracking code.
Example output: {"recommendedTool":"track_shipment","riskLevel":"low","missingData":["tracking_id"],"requiresClarification":true,"clarificationQuestion":"Send me the full tracking code.","rationale":"Tracking needs the tracking code."}"#;

fn role_prompt(role: ModelRole) -> &'static str {
    match role {
        ModelRole::RequestManager => {
            "You are REQUEST_MANAGER.\nClassify the request into domain, channel, intentId, reason and confidence.\nJSON schema: {\"domain\":\"...\",\"channel\":\"...\",\"intentId\":\"...\",\"reason\":\"...\",\"confidence\":0-100}"
        }
        ModelRole::DomainDecomposer => {
            "You are DOMAIN_DECOMPOSER.\nSplit the request into granular subtasks with minimal dependencies.\nJSON schema: {\"subtasks\":[{\"id\":\"task_1\",\"domain\":\"...\",\"intentId\":\"...\",\"goal\":\"...\",\"dependsOn\":[],\"acceptance\":\"...\"}]}"
        }
        ModelRole::TaskPlanner => {
            "You are TASK_PLANNER.\nOrder and normalize the tasks for execution.\nJSON schema: {\"tasks\":[{\"id\":\"...\",\"domain\":\"...\",\"intentId\":\"...\",\"goal\":\"...\",\"dependsOn\":[],\"acceptance\":\"...\"}]}"
        }
        ModelRole::Planner => {
            "You are PLANNER.\nFor one task, build ordered steps with tool candidates.\nJSON schema: {\"steps\":[{\"id\":\"...\",\"goal\":\"...\",\"toolCandidates\":[\"tool_a\"],\"expectedOutcome\":\"...\"}]}"
        }
        ModelRole::ToolAnalysis => {
            "You are TOOL_ANALYSIS.\nAssess risk, missing data and the recommended tool for the step.\nJSON schema: {\"recommendedTool\":\"...\",\"riskLevel\":\"low|medium|high|critical\",\"missingData\":[],\"requiresClarification\":false,\"clarificationQuestion\":\"...\",\"rationale\":\"...\"}"
        }
        ModelRole::ToolArgument => {
            "You are TOOL_ARGUMENT.\nProduce arguments consistent with the selected tool schema and the context.\nJSON schema: {\"tool\":\"...\",\"args\":{},\"rationale\":\"...\"}"
        }
        ModelRole::ToolCaller => {
            "You are TOOL_CALLER.\nConfirm the final tool and safe final arguments.\nJSON schema: {\"tool\":\"...\",\"args\":{},\"reason\":\"...\"}"
        }
        ModelRole::CommandBuilder => {
            "You are COMMAND_BUILDER.\nNormalize the final command against the tool schema and policy.\nJSON schema: {\"tool\":\"...\",\"args\":{}}"
        }
        ModelRole::Aggregator => {
            "You are AGGREGATOR.\nAggregate multi-step results and resolve conflicts deterministically.\nJSON schema: {\"summary\":\"...\",\"message\":\"...\",\"clarificationRequired\":false,\"clarificationQuestion\":\"...\",\"agentState\":{},\"sessionState\":{}}"
        }
        ModelRole::Finalizer => {
            "You are FINALIZER.\nWrite the final user-facing answer, clear and actionable, in the user's language.\nJSON schema: {\"message\":\"...\",\"clarificationRequest\":\"...\",\"nextAction\":\"...\"}"
        }
    }
}

pub fn system_prompt(role: ModelRole, domain: Option<Domain>) -> String {
    let mut sections = vec![role_prompt(role).to_string()];
    match role {
        ModelRole::RequestManager => {
            sections.push(REQUEST_MANAGER_ROUTING.to_string());
            sections.push(REQUEST_MANAGER_EXAMPLES.to_string());
        }
        ModelRole::ToolAnalysis => {
            sections.push(TOOL_ANALYSIS_GUIDE.to_string());
            sections.push(TOOL_ANALYSIS_EXAMPLES.to_string());
        }
        _ => {}
    }

    if let Some(domain) = domain {
        sections.push(base_guardrails(domain));
    }

    sections.join("\n\n")
}
