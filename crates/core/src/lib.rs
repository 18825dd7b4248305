pub mod clock;
pub mod config;
pub mod contracts;
pub mod domain;
pub mod errors;
pub mod models;
pub mod pipeline;
pub mod policy;
pub mod trace;

pub use clock::{Clock, FixedClock, SystemClock};
pub use domain::approval::{ApprovalId, ApprovalPayload};
pub use domain::planning::{DomainTask, ToolPlanStep};
pub use domain::routing::{Channel, Domain, RequestClassification, RiskLevel};
pub use domain::tool::{ToolArguments, ToolCall, ToolCatalog, ToolSpec};
pub use errors::{
    ContractError, InterfaceError, OrchestratorError, StageErrorCode, StageExecutionError,
};
pub use models::{ModelResolver, ModelRole, StaticModelResolver};
pub use pipeline::{
    ExecutionState, OrchestratorInput, OrchestratorMetadata, OrchestratorOutput, RunOutcome,
    StepResult, ToolExecutionResult,
};
pub use trace::{Stage, StageTrace, StageTraceEntry, StageTraceSummary};
