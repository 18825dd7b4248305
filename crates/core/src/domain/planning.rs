use serde::{Deserialize, Serialize};

use crate::domain::routing::Domain;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainTask {
    pub id: String,
    pub domain: Domain,
    pub intent_id: String,
    pub goal: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance: Option<String>,
}

/// One ordered unit of work inside a task. `tool_candidates` is never empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPlanStep {
    pub id: String,
    pub task_id: String,
    pub goal: String,
    pub tool_candidates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_outcome: Option<String>,
}

impl ToolPlanStep {
    pub fn has_candidate(&self, tool_name: &str) -> bool {
        self.tool_candidates.iter().any(|candidate| candidate == tool_name)
    }
}
