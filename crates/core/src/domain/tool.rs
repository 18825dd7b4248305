use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::routing::{Channel, Domain, RiskLevel};

pub type ToolArguments = Map<String, Value>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    #[default]
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolProperty {
    #[serde(rename = "type", default)]
    pub kind: PropertyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<String>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    #[default]
    Read,
    Write,
    Action,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tenancy {
    #[default]
    None,
    WorkspaceRequired,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionPolicy {
    #[serde(default)]
    pub category: ToolCategory,
    #[serde(default)]
    pub tenancy: Tenancy,
    #[serde(default)]
    pub requires_approval: bool,
}

/// Catalog entry describing one business tool the executor can run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub properties: BTreeMap<String, ToolProperty>,
    #[serde(default)]
    pub required: Vec<String>,
    /// Empty means the tool is available in every domain.
    #[serde(default)]
    pub domains: Vec<Domain>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub policy: ToolExecutionPolicy,
}

impl ToolSpec {
    pub fn allows_domain(&self, domain: Domain) -> bool {
        self.domains.is_empty() || self.domains.contains(&domain)
    }

    pub fn allows_channel(&self, channel: Channel) -> bool {
        self.channels.is_empty() || self.channels.contains(&channel)
    }

    /// True when every required property is present and non-empty in `arguments`.
    pub fn required_satisfied_by(&self, arguments: &ToolArguments) -> bool {
        self.missing_required(arguments).is_empty()
    }

    pub fn missing_required(&self, arguments: &ToolArguments) -> Vec<String> {
        self.required
            .iter()
            .filter(|key| is_blank(arguments.get(key.as_str())))
            .cloned()
            .collect()
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(text)) => text.is_empty(),
        Some(_) => false,
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: ToolArguments,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: ToolArguments) -> Self {
        Self { name: name.into(), arguments }
    }
}

/// Closed set of tools available to one run. Every name the pipeline acts on
/// must resolve through this catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolCatalog {
    tools: Vec<ToolSpec>,
}

impl ToolCatalog {
    pub fn new(tools: Vec<ToolSpec>) -> Self {
        Self { tools }
    }

    /// Add `spec`, replacing any entry with the same name.
    pub fn insert(&mut self, spec: ToolSpec) {
        match self.tools.iter_mut().find(|tool| tool.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.tools.push(spec),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    pub fn for_domain(&self, domain: Domain) -> ToolCatalog {
        Self { tools: self.tools.iter().filter(|tool| tool.allows_domain(domain)).cloned().collect() }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|tool| tool.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
