use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::routing::{Channel, Domain};
use crate::domain::tool::{Tenancy, ToolCall, ToolSpec};

/// Identity keys a model must never be able to inject into a tool call.
pub const FORBIDDEN_ARG_KEYS: [&str; 4] = ["userId", "user_id", "workspaceId", "workspace_id"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SafetyContext<'a> {
    pub domain: Domain,
    pub channel: Channel,
    pub workspace_id: Option<&'a str>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyRejectionCode {
    ToolMismatch,
    DomainForbidden,
    ChannelForbidden,
    MissingWorkspace,
    MissingRequiredArgs,
    InvalidArgs,
}

impl SafetyRejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolMismatch => "tool_mismatch",
            Self::DomainForbidden => "domain_forbidden",
            Self::ChannelForbidden => "channel_forbidden",
            Self::MissingWorkspace => "missing_workspace",
            Self::MissingRequiredArgs => "missing_required_args",
            Self::InvalidArgs => "invalid_args",
        }
    }
}

impl fmt::Display for SafetyRejectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyRejection {
    pub code: SafetyRejectionCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_args: Vec<String>,
}

impl SafetyRejection {
    fn new(code: SafetyRejectionCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), missing_args: Vec::new() }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SafetyDecision {
    Allow { sanitized_call: ToolCall },
    Reject(SafetyRejection),
}

impl SafetyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Gate a proposed call against its catalog spec. On success the returned
/// call has every forbidden identity key removed.
pub fn evaluate(spec: &ToolSpec, call: &ToolCall, context: &SafetyContext<'_>) -> SafetyDecision {
    match check(spec, call, context) {
        Ok(sanitized_call) => SafetyDecision::Allow { sanitized_call },
        Err(rejection) => SafetyDecision::Reject(rejection),
    }
}

fn check(
    spec: &ToolSpec,
    call: &ToolCall,
    context: &SafetyContext<'_>,
) -> Result<ToolCall, SafetyRejection> {
    if call.name != spec.name {
        return Err(SafetyRejection::new(
            SafetyRejectionCode::ToolMismatch,
            format!("The requested action \"{}\" does not match tool \"{}\".", call.name, spec.name),
        ));
    }

    if !spec.allows_domain(context.domain) {
        return Err(SafetyRejection::new(
            SafetyRejectionCode::DomainForbidden,
            format!("Tool \"{}\" is not available for {} requests.", spec.name, context.domain),
        ));
    }

    if !spec.allows_channel(context.channel) {
        return Err(SafetyRejection::new(
            SafetyRejectionCode::ChannelForbidden,
            format!("Tool \"{}\" is not available on the {} channel.", spec.name, context.channel),
        ));
    }

    let has_workspace = context.workspace_id.is_some_and(|id| !id.trim().is_empty());
    if spec.policy.tenancy == Tenancy::WorkspaceRequired && !has_workspace {
        return Err(SafetyRejection::new(
            SafetyRejectionCode::MissingWorkspace,
            "Select a workspace before running this action.",
        ));
    }

    let mut arguments = call.arguments.clone();
    arguments.retain(|key, _| !FORBIDDEN_ARG_KEYS.contains(&key.as_str()));

    let missing_args = spec.missing_required(&arguments);
    if !missing_args.is_empty() {
        return Err(SafetyRejection {
            code: SafetyRejectionCode::MissingRequiredArgs,
            message: format!("I still need: {}.", missing_args.join(", ")),
            missing_args,
        });
    }

    for (key, value) in &arguments {
        let Some(property) = spec.properties.get(key) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        if !property.kind.accepts(value) {
            return Err(SafetyRejection::new(
                SafetyRejectionCode::InvalidArgs,
                format!("Field \"{key}\" must be of type {}.", property.kind.as_str()),
            ));
        }
        if let (Some(allowed), Value::String(text)) = (&property.allowed_values, value) {
            if !allowed.iter().any(|candidate| candidate == text) {
                return Err(SafetyRejection::new(
                    SafetyRejectionCode::InvalidArgs,
                    format!("Field \"{key}\" must be one of: {}.", allowed.join(", ")),
                ));
            }
        }
    }

    Ok(ToolCall::new(spec.name.clone(), arguments))
}
