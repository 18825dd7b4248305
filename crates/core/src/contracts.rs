//! Output contracts for every model-backed stage.
//!
//! Each parser accepts the raw model text (optionally wrapped in a markdown
//! fence), requires a single JSON object, type-checks every field and applies
//! the stage's cross-field rules. Any violation is a [`ContractError`], which
//! the stage runner feeds back into the next attempt.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::planning::{DomainTask, ToolPlanStep};
use crate::domain::routing::{Channel, Domain, RequestClassification, RiskLevel};
use crate::domain::tool::ToolArguments;
use crate::errors::ContractError;

type JsonObject = Map<String, Value>;

pub fn strip_json_fence(raw: &str) -> &str {
    let mut text = raw.trim();
    for opener in ["```json", "```JSON", "```"] {
        if let Some(rest) = text.strip_prefix(opener) {
            text = rest;
            break;
        }
    }
    text.trim().strip_suffix("```").unwrap_or(text).trim()
}

pub fn parse_object(raw: &str) -> Result<JsonObject, ContractError> {
    let cleaned = strip_json_fence(raw);
    if cleaned.is_empty() {
        return Err(ContractError::new("Empty JSON payload"));
    }

    let parsed: Value = serde_json::from_str(cleaned)
        .map_err(|error| ContractError::new(format!("Invalid JSON payload: {error}")))?;

    match parsed {
        Value::Object(object) => Ok(object),
        _ => Err(ContractError::new("JSON payload must be an object")),
    }
}

fn required_string(value: Option<&Value>, field: &str) -> Result<String, ContractError> {
    match value {
        Some(Value::String(text)) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        _ => Err(ContractError::new(format!("Field \"{field}\" must be a non-empty string"))),
    }
}

fn optional_string(value: Option<&Value>, field: &str) -> Result<Option<String>, ContractError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => {
            let trimmed = text.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        Some(_) => Err(ContractError::new(format!("Field \"{field}\" must be a string"))),
    }
}

fn number(value: Option<&Value>, field: &str) -> Result<f64, ContractError> {
    value
        .and_then(Value::as_f64)
        .filter(|number| number.is_finite())
        .ok_or_else(|| ContractError::new(format!("Field \"{field}\" must be a number")))
}

fn flag(value: Option<&Value>, field: &str) -> Result<bool, ContractError> {
    match value {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(_) => Err(ContractError::new(format!("Field \"{field}\" must be a boolean"))),
    }
}

fn string_array(value: Option<&Value>, field: &str) -> Result<Vec<String>, ContractError> {
    let Some(Value::Array(entries)) = value else {
        return Err(ContractError::new(format!("Field \"{field}\" must be an array")));
    };

    entries
        .iter()
        .map(|entry| match entry {
            Value::String(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            _ => Err(ContractError::new(format!("Field \"{field}\" must contain only strings"))),
        })
        .collect()
}

fn optional_string_array(
    value: Option<&Value>,
    field: &str,
) -> Result<Vec<String>, ContractError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        present => string_array(present, field),
    }
}

fn record(value: Option<&Value>, field: &str) -> Result<JsonObject, ContractError> {
    match value {
        Some(Value::Object(object)) => Ok(object.clone()),
        _ => Err(ContractError::new(format!("Field \"{field}\" must be an object"))),
    }
}

fn optional_record(
    value: Option<&Value>,
    field: &str,
) -> Result<Option<JsonObject>, ContractError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        present => record(present, field).map(Some),
    }
}

fn non_empty_array<'a>(object: &'a JsonObject, field: &str) -> Result<&'a [Value], ContractError> {
    match object.get(field) {
        Some(Value::Array(entries)) if !entries.is_empty() => Ok(entries),
        _ => Err(ContractError::new(format!("Field \"{field}\" must be a non-empty array"))),
    }
}

fn closed_enum<T: FromStr<Err = String>>(
    value: Option<&Value>,
    field: &str,
) -> Result<T, ContractError> {
    required_string(value, field)?.parse::<T>().map_err(ContractError::new)
}

/// Classifier output. The channel must be the fixed channel of the domain.
pub fn parse_request_classification(raw: &str) -> Result<RequestClassification, ContractError> {
    let object = parse_object(raw)?;
    let domain: Domain = closed_enum(object.get("domain"), "domain")?;
    let channel: Channel = closed_enum(object.get("channel"), "channel")?;
    if channel != domain.channel() {
        return Err(ContractError::new(format!(
            "Channel \"{channel}\" is inconsistent with domain \"{domain}\" (expected \"{}\")",
            domain.channel()
        )));
    }

    let confidence = number(object.get("confidence"), "confidence")?;

    Ok(RequestClassification {
        domain,
        channel,
        intent_id: required_string(object.get("intentId"), "intentId")?,
        reason: required_string(object.get("reason"), "reason")?,
        confidence: confidence.round().clamp(0.0, 100.0) as u8,
    })
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decomposition {
    pub subtasks: Vec<DomainTask>,
}

pub fn parse_decomposition(
    raw: &str,
    fallback_domain: Domain,
    fallback_intent_id: &str,
) -> Result<Decomposition, ContractError> {
    let object = parse_object(raw)?;
    let subtasks = non_empty_array(&object, "subtasks")?
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let path = format!("subtasks[{index}]");
            let subtask = record(Some(entry), &path)?;
            let domain = match subtask.get("domain") {
                None | Some(Value::Null) => fallback_domain,
                present => closed_enum(present, &format!("{path}.domain"))?,
            };

            Ok(DomainTask {
                id: optional_string(subtask.get("id"), &format!("{path}.id"))?
                    .unwrap_or_else(|| format!("task_{}", index + 1)),
                domain,
                intent_id: optional_string(subtask.get("intentId"), &format!("{path}.intentId"))?
                    .unwrap_or_else(|| fallback_intent_id.to_string()),
                goal: required_string(subtask.get("goal"), &format!("{path}.goal"))?,
                depends_on: optional_string_array(
                    subtask.get("dependsOn"),
                    &format!("{path}.dependsOn"),
                )?,
                acceptance: optional_string(
                    subtask.get("acceptance"),
                    &format!("{path}.acceptance"),
                )?,
            })
        })
        .collect::<Result<Vec<_>, ContractError>>()?;

    Ok(Decomposition { subtasks })
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub tasks: Vec<DomainTask>,
}

/// Normalized task list. Every task must stay in the classified domain.
pub fn parse_task_plan(raw: &str, expected_domain: Domain) -> Result<TaskPlan, ContractError> {
    let object = parse_object(raw)?;
    let tasks = non_empty_array(&object, "tasks")?
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let path = format!("tasks[{index}]");
            let task = record(Some(entry), &path)?;
            let domain: Domain = closed_enum(task.get("domain"), &format!("{path}.domain"))?;
            if domain != expected_domain {
                return Err(ContractError::new(format!(
                    "{path}.domain \"{domain}\" must match classified domain \"{expected_domain}\""
                )));
            }

            Ok(DomainTask {
                id: optional_string(task.get("id"), &format!("{path}.id"))?
                    .unwrap_or_else(|| format!("task_{}", index + 1)),
                domain,
                intent_id: required_string(task.get("intentId"), &format!("{path}.intentId"))?,
                goal: required_string(task.get("goal"), &format!("{path}.goal"))?,
                depends_on: optional_string_array(
                    task.get("dependsOn"),
                    &format!("{path}.dependsOn"),
                )?,
                acceptance: optional_string(task.get("acceptance"), &format!("{path}.acceptance"))?,
            })
        })
        .collect::<Result<Vec<_>, ContractError>>()?;

    Ok(TaskPlan { tasks })
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPlan {
    pub steps: Vec<ToolPlanStep>,
}

pub fn parse_step_plan(raw: &str, task_id: &str) -> Result<StepPlan, ContractError> {
    let object = parse_object(raw)?;
    let steps = non_empty_array(&object, "steps")?
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let path = format!("steps[{index}]");
            let step = record(Some(entry), &path)?;
            let tool_candidates =
                string_array(step.get("toolCandidates"), &format!("{path}.toolCandidates"))?;
            if tool_candidates.is_empty() {
                return Err(ContractError::new(format!("{path}.toolCandidates cannot be empty")));
            }

            Ok(ToolPlanStep {
                id: optional_string(step.get("id"), &format!("{path}.id"))?
                    .unwrap_or_else(|| format!("{task_id}_step_{}", index + 1)),
                task_id: task_id.to_string(),
                goal: required_string(step.get("goal"), &format!("{path}.goal"))?,
                tool_candidates,
                expected_outcome: optional_string(
                    step.get("expectedOutcome"),
                    &format!("{path}.expectedOutcome"),
                )?,
            })
        })
        .collect::<Result<Vec<_>, ContractError>>()?;

    Ok(StepPlan { steps })
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnalysis {
    pub recommended_tool: String,
    pub risk_level: RiskLevel,
    pub missing_data: Vec<String>,
    pub requires_clarification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// Tool analysis for one step. The recommended tool must be one of the
/// step's candidates, and the clarification flag must agree with the
/// missing-data list.
pub fn parse_tool_analysis(raw: &str, candidates: &[String]) -> Result<ToolAnalysis, ContractError> {
    let object = parse_object(raw)?;
    let recommended_tool = required_string(object.get("recommendedTool"), "recommendedTool")?;
    if !candidates.iter().any(|candidate| *candidate == recommended_tool) {
        return Err(ContractError::new(format!(
            "recommendedTool \"{recommended_tool}\" is not one of the step candidates [{}]",
            candidates.join(", ")
        )));
    }

    let risk_level = match object.get("riskLevel") {
        None | Some(Value::Null) => RiskLevel::Low,
        present => closed_enum(present, "riskLevel")?,
    };
    let missing_data = optional_string_array(object.get("missingData"), "missingData")?;
    let requires_clarification = flag(object.get("requiresClarification"), "requiresClarification")?;

    if requires_clarification != !missing_data.is_empty() {
        return Err(ContractError::new(if requires_clarification {
            "requiresClarification=true requires a non-empty missingData list"
        } else {
            "missingData is not empty, so requiresClarification must be true"
        }));
    }

    let clarification_question =
        optional_string(object.get("clarificationQuestion"), "clarificationQuestion")?;
    if requires_clarification && clarification_question.is_none() {
        return Err(ContractError::new(
            "clarificationQuestion is mandatory when requiresClarification=true",
        ));
    }

    Ok(ToolAnalysis {
        recommended_tool,
        risk_level,
        missing_data,
        requires_clarification,
        clarification_question: clarification_question.filter(|_| requires_clarification),
        rationale: optional_string(object.get("rationale"), "rationale")?,
    })
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolArgumentDraft {
    pub tool: String,
    pub args: ToolArguments,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

pub fn parse_tool_argument_draft(raw: &str) -> Result<ToolArgumentDraft, ContractError> {
    let object = parse_object(raw)?;
    Ok(ToolArgumentDraft {
        tool: required_string(object.get("tool"), "tool")?,
        args: record(object.get("args"), "args")?,
        rationale: optional_string(object.get("rationale"), "rationale")?,
    })
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallConfirmation {
    pub tool: String,
    pub args: ToolArguments,
    pub reason: String,
}

pub fn parse_tool_call_confirmation(raw: &str) -> Result<ToolCallConfirmation, ContractError> {
    let object = parse_object(raw)?;
    Ok(ToolCallConfirmation {
        tool: required_string(object.get("tool"), "tool")?,
        args: record(object.get("args"), "args")?,
        reason: required_string(object.get("reason"), "reason")?,
    })
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedCommand {
    pub tool: String,
    pub args: ToolArguments,
}

pub fn parse_normalized_command(raw: &str) -> Result<NormalizedCommand, ContractError> {
    let object = parse_object(raw)?;
    Ok(NormalizedCommand {
        tool: required_string(object.get("tool"), "tool")?,
        args: record(object.get("args"), "args")?,
    })
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregation {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub clarification_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_state: Option<JsonObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_state: Option<JsonObject>,
}

pub fn parse_aggregation(raw: &str) -> Result<Aggregation, ContractError> {
    let object = parse_object(raw)?;
    Ok(Aggregation {
        summary: required_string(object.get("summary"), "summary")?,
        message: optional_string(object.get("message"), "message")?,
        clarification_required: flag(
            object.get("clarificationRequired"),
            "clarificationRequired",
        )?,
        clarification_question: optional_string(
            object.get("clarificationQuestion"),
            "clarificationQuestion",
        )?,
        agent_state: optional_record(object.get("agentState"), "agentState")?,
        session_state: optional_record(object.get("sessionState"), "sessionState")?,
    })
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finalization {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<String>,
}

pub fn parse_finalization(raw: &str) -> Result<Finalization, ContractError> {
    let object = parse_object(raw)?;
    Ok(Finalization {
        message: required_string(object.get("message"), "message")?,
        clarification_request: optional_string(
            object.get("clarificationRequest"),
            "clarificationRequest",
        )?,
        next_action: optional_string(object.get("nextAction"), "nextAction")?,
    })
}
