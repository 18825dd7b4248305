//! Skips the four tool-selection stages for single-step, high-confidence
//! requests whose preferred tool needs no user-supplied arguments.

use stagewise_core::domain::planning::ToolPlanStep;
use stagewise_core::domain::routing::{Domain, RequestClassification};
use stagewise_core::domain::tool::{ToolArguments, ToolCall, ToolCatalog, ToolSpec};
use stagewise_core::pipeline::OrchestratorInput;
use stagewise_core::trace::{Stage, StageTrace, StageTraceEntry};

pub const MIN_DIRECT_CONFIDENCE: u8 = 80;

pub const BYPASSED_STAGES: [Stage; 4] =
    [Stage::ToolAnalysis, Stage::ToolArgument, Stage::ToolCaller, Stage::CommandBuilder];

pub fn preferred_tools(domain: Domain) -> &'static [&'static str] {
    match domain {
        Domain::Quote => &["shipment_quote_orchestrated"],
        Domain::Shipment => &["shipment_create_orchestrated"],
        Domain::Support | Domain::Crm | Domain::Outreach => &[],
        Domain::Listini => &["listini_orchestrated"],
        Domain::Mentor => &["mentor_orchestrated"],
        Domain::Debug => &["debug_orchestrated"],
        Domain::Explain => &["explain_orchestrated"],
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DirectDecision {
    pub spec: ToolSpec,
    pub call: ToolCall,
    pub reason: String,
}

/// Arguments derivable without asking the model or the user. Nothing is
/// derivable yet, so only tools without required properties qualify.
pub fn deterministic_arguments(_spec: &ToolSpec, _input: &OrchestratorInput) -> ToolArguments {
    ToolArguments::new()
}

pub fn choose(
    classification: &RequestClassification,
    step: &ToolPlanStep,
    steps_in_task: usize,
    catalog: &ToolCatalog,
    input: &OrchestratorInput,
) -> Option<DirectDecision> {
    if steps_in_task != 1 || classification.confidence < MIN_DIRECT_CONFIDENCE {
        return None;
    }

    if !step.tool_candidates.iter().any(|name| catalog.get(name).is_some()) {
        return None;
    }

    preferred_tools(classification.domain).iter().find_map(|preferred| {
        let spec = catalog.get(preferred)?;
        let arguments = deterministic_arguments(spec, input);
        if !spec.required_satisfied_by(&arguments) {
            return None;
        }

        Some(DirectDecision {
            spec: spec.clone(),
            call: ToolCall::new(spec.name.clone(), arguments),
            reason: format!("direct_path:domain_override:{}:{}", classification.domain, spec.name),
        })
    })
}

pub fn record_bypass(trace: &mut StageTrace) {
    for stage in BYPASSED_STAGES {
        trace.push(StageTraceEntry::bypassed(stage));
    }
}
