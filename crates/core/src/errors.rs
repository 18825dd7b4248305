use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::trace::Stage;

/// A stage produced output that does not satisfy its contract.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ContractError {
    pub message: String,
}

impl ContractError {
    pub const CODE: &'static str = "stage_contract_invalid";

    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    pub fn code(&self) -> &'static str {
        Self::CODE
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorCode {
    InvalidJsonContract,
    ModelUnavailable,
    StageFailed,
}

impl StageErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidJsonContract => "invalid_json_contract",
            Self::ModelUnavailable => "model_unavailable",
            Self::StageFailed => "stage_failed",
        }
    }
}

impl fmt::Display for StageErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage exhausted its attempts.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("stage {stage} failed after {attempts} attempt(s) [{code}]: {message}")]
pub struct StageExecutionError {
    pub stage: Stage,
    pub code: StageErrorCode,
    pub message: String,
    pub attempts: u32,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error(transparent)]
    Stage(#[from] StageExecutionError),
    #[error("tool execution failed: {0}")]
    ToolExecution(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::ServiceUnavailable { .. } => {
                "The AI service is temporarily unavailable. Please try again in a few minutes."
            }
            Self::Internal { .. } => {
                "Sorry, something went wrong while handling your request. Please try again shortly."
            }
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl OrchestratorError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        match self {
            Self::Stage(error) if error.code == StageErrorCode::ModelUnavailable => {
                InterfaceError::ServiceUnavailable { message: error.to_string(), correlation_id }
            }
            Self::Stage(error) => {
                InterfaceError::Internal { message: error.to_string(), correlation_id }
            }
            Self::ToolExecution(message) => InterfaceError::Internal { message, correlation_id },
        }
    }
}
