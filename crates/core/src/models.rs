//! Model role resolution.
//!
//! Each pipeline stage runs under a [`ModelRole`]. The concrete model id is
//! looked up in this order: domain+role override, role override, global
//! default. `None` means the chat backend should use its own default.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::routing::Domain;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    RequestManager,
    DomainDecomposer,
    TaskPlanner,
    Planner,
    ToolAnalysis,
    ToolArgument,
    ToolCaller,
    CommandBuilder,
    Aggregator,
    Finalizer,
}

impl ModelRole {
    pub const ALL: [ModelRole; 10] = [
        Self::RequestManager,
        Self::DomainDecomposer,
        Self::TaskPlanner,
        Self::Planner,
        Self::ToolAnalysis,
        Self::ToolArgument,
        Self::ToolCaller,
        Self::CommandBuilder,
        Self::Aggregator,
        Self::Finalizer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestManager => "request_manager",
            Self::DomainDecomposer => "domain_decomposer",
            Self::TaskPlanner => "task_planner",
            Self::Planner => "planner",
            Self::ToolAnalysis => "tool_analysis",
            Self::ToolArgument => "tool_argument",
            Self::ToolCaller => "tool_caller",
            Self::CommandBuilder => "command_builder",
            Self::Aggregator => "aggregator",
            Self::Finalizer => "finalizer",
        }
    }

    pub fn env_suffix(&self) -> String {
        self.as_str().to_ascii_uppercase()
    }
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let key = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|role| role.as_str() == key)
            .ok_or_else(|| format!("unknown model role `{key}`"))
    }
}

pub trait ModelResolver: Send + Sync {
    fn resolve(&self, role: ModelRole, domain: Option<Domain>) -> Option<String>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StaticModelResolver {
    default_model: Option<String>,
    roles: HashMap<ModelRole, String>,
    domain_roles: HashMap<(Domain, ModelRole), String>,
}

impl StaticModelResolver {
    pub fn new(default_model: Option<String>) -> Self {
        Self { default_model: non_empty(default_model), ..Self::default() }
    }

    pub fn with_role(mut self, role: ModelRole, model: impl Into<String>) -> Self {
        if let Some(model) = non_empty(Some(model.into())) {
            self.roles.insert(role, model);
        }
        self
    }

    pub fn with_domain_role(
        mut self,
        domain: Domain,
        role: ModelRole,
        model: impl Into<String>,
    ) -> Self {
        if let Some(model) = non_empty(Some(model.into())) {
            self.domain_roles.insert((domain, role), model);
        }
        self
    }
}

impl ModelResolver for StaticModelResolver {
    fn resolve(&self, role: ModelRole, domain: Option<Domain>) -> Option<String> {
        domain
            .and_then(|domain| self.domain_roles.get(&(domain, role)))
            .or_else(|| self.roles.get(&role))
            .or(self.default_model.as_ref())
            .cloned()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}
