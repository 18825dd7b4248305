use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::routing::RiskLevel;
use crate::domain::tool::ToolArguments;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApprovalId(pub String);

/// Pending human confirmation for a tool call that must not run unattended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalPayload {
    pub id: ApprovalId,
    pub tool: String,
    pub description: String,
    pub risk_level: RiskLevel,
    pub args: ToolArguments,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
