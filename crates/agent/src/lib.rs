//! Agent runtime: the model-backed stages of the orchestration pipeline.
//!
//! A run moves through a constrained loop:
//! 1. **Routing** (`stages::classify`, `decompose`, `plan_tasks`) - turn the
//!    free-text request into a classified domain and a task list
//! 2. **Tool selection** (`stages`, `direct_path`) - pick one tool per step and
//!    build its arguments, or skip straight to a preferred tool
//! 3. **Gating** - tool safety and approval policies from `stagewise-core`
//! 4. **Execution** (`tools`) - call the business tool behind `ToolExecutor`
//! 5. **Reply** (`stages::aggregate`, `finalize`) - compose the user message
//!
//! # Key Types
//!
//! - `Orchestrator` - runs one request to exactly one outcome
//! - `ModelChat` - pluggable chat backend, one call per stage attempt
//! - `StageRunner` - bounded retry with error feedback for every stage
//!
//! The model only proposes. Contracts are validated and policies are decided
//! deterministically before any tool runs.

pub mod direct_path;
pub mod llm;
pub mod orchestrator;
pub mod prompts;
pub mod runner;
pub mod scripted;
pub mod stages;
pub mod tools;

pub use llm::{ChatMessage, ChatOptions, ChatResponse, ChatRole, ModelChat, TokenUsage};
pub use orchestrator::Orchestrator;
pub use runner::{RunnerSettings, StageRunner};
pub use scripted::ScriptedModelChat;
pub use tools::{Tool, ToolContext, ToolExecutor, ToolRegistry};
