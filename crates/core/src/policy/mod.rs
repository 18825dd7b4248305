//! Deterministic gates every tool call passes before execution.

pub mod approval;
pub mod safety;

pub use approval::{ApprovalDecision, ApprovalPolicy};
pub use safety::{SafetyContext, SafetyDecision, SafetyRejection, SafetyRejectionCode};
