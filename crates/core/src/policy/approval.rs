use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::approval::{ApprovalId, ApprovalPayload};
use crate::domain::routing::RiskLevel;
use crate::domain::tool::{ToolCall, ToolSpec};

pub const DEFAULT_APPROVAL_TTL_SECS: u64 = 300;

/// The confirmation has to open the message: "non ok" or "impossibile
/// procedere" must never count as consent.
static CONFIRMATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:conferma|confermo|confirmed|confirm|procedi|proceed|vai|okay|ok|sì|si|yes|autorizzo|authorize|authorise)\b",
    )
    .unwrap()
});

pub fn is_confirmation(message: &str) -> bool {
    CONFIRMATION.is_match(message)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDecision {
    pub required: bool,
    pub approved: bool,
    pub risk_level: RiskLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ApprovalPayload>,
}

impl ApprovalDecision {
    /// Required and not granted: the turn has to stop and ask the user.
    pub fn is_pending(&self) -> bool {
        self.required && !self.approved
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApprovalPolicy {
    ttl: Duration,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self::with_ttl_secs(DEFAULT_APPROVAL_TTL_SECS)
    }
}

impl ApprovalPolicy {
    pub fn with_ttl_secs(ttl_secs: u64) -> Self {
        Self { ttl: Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX / 1_000)) }
    }

    pub fn evaluate(
        &self,
        spec: &ToolSpec,
        call: &ToolCall,
        message: &str,
        now: DateTime<Utc>,
    ) -> ApprovalDecision {
        let risk_level = spec.risk_level;
        let required =
            spec.requires_approval || spec.policy.requires_approval || risk_level.requires_approval();

        if !required {
            return ApprovalDecision { required, approved: true, risk_level, payload: None };
        }

        if is_confirmation(message) {
            return ApprovalDecision { required, approved: true, risk_level, payload: None };
        }

        let payload = ApprovalPayload {
            id: ApprovalId(format!("approval_{}_{}", now.timestamp_millis(), spec.name)),
            tool: spec.name.clone(),
            description: describe(spec),
            risk_level,
            args: call.arguments.clone(),
            created_at: now,
            expires_at: now + self.ttl,
        };

        ApprovalDecision { required, approved: false, risk_level, payload: Some(payload) }
    }
}

fn describe(spec: &ToolSpec) -> String {
    format!(
        "The action \"{}\" ({}) has {} risk and needs your explicit confirmation. Reply \"confirm\" to proceed.",
        spec.name, spec.description, spec.risk_level
    )
}
