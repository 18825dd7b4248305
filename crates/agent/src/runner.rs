//! Bounded retry-with-feedback execution of a single model-backed stage.

use std::time::Instant;

use stagewise_core::config::PipelineConfig;
use stagewise_core::domain::routing::Domain;
use stagewise_core::errors::{ContractError, StageErrorCode, StageExecutionError};
use stagewise_core::models::{ModelResolver, ModelRole};
use stagewise_core::trace::{Stage, StageTrace, StageTraceEntry, DEFAULT_TOKEN_ALERT_THRESHOLD};
use tracing::{debug, warn};

use crate::llm::{is_model_unavailable, ChatMessage, ChatOptions, ModelChat, TokenUsage};

const FALLBACK_MODEL_LABEL: &str = "default";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunnerSettings {
    pub max_attempts: u32,
    pub max_output_tokens: u32,
    pub token_alert_threshold: u32,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            max_output_tokens: 900,
            token_alert_threshold: DEFAULT_TOKEN_ALERT_THRESHOLD,
        }
    }
}

impl From<&PipelineConfig> for RunnerSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_stage_attempts.max(1),
            max_output_tokens: config.max_output_tokens,
            token_alert_threshold: config.token_alert_threshold,
        }
    }
}

/// Roughly four characters per token, rounded up.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

struct AttemptFailure {
    code: StageErrorCode,
    message: String,
}

pub struct StageRunner<'a> {
    chat: &'a dyn ModelChat,
    resolver: &'a dyn ModelResolver,
    settings: RunnerSettings,
    pipeline_id: &'a str,
    trace_id: &'a str,
}

impl<'a> StageRunner<'a> {
    pub fn new(
        chat: &'a dyn ModelChat,
        resolver: &'a dyn ModelResolver,
        settings: RunnerSettings,
        pipeline_id: &'a str,
        trace_id: &'a str,
    ) -> Self {
        Self { chat, resolver, settings, pipeline_id, trace_id }
    }

    pub fn settings(&self) -> RunnerSettings {
        self.settings
    }

    /// Run one stage until `parse` accepts the model output or the attempt
    /// budget is spent. `build` receives the 1-based attempt number and the
    /// previous attempt's error text. Every attempt is appended to `trace`.
    pub async fn run<T, B, P>(
        &self,
        role: ModelRole,
        domain: Option<Domain>,
        trace: &mut StageTrace,
        build: B,
        parse: P,
    ) -> Result<T, StageExecutionError>
    where
        B: Fn(u32, Option<&str>) -> Vec<ChatMessage>,
        P: Fn(&str) -> Result<T, ContractError>,
    {
        let stage = Stage::from(role);
        let max_attempts = self.settings.max_attempts.max(1);
        let mut last_error: Option<AttemptFailure> = None;

        for attempt in 1..=max_attempts {
            let messages = build(attempt, last_error.as_ref().map(|error| error.message.as_str()));
            let raw_input = serde_json::to_string(&messages).unwrap_or_default();
            let input_estimate =
                estimate_tokens(&messages.iter().map(|m| m.content.as_str()).collect::<String>());
            let model = self.resolver.resolve(role, domain);
            let options = ChatOptions {
                model: model.clone(),
                domain,
                pipeline_id: self.pipeline_id.to_string(),
                trace_id: self.trace_id.to_string(),
                temperature: 0.0,
                max_output_tokens: self.settings.max_output_tokens,
            };

            let started = Instant::now();
            let response = self.chat.chat(role, &messages, &options).await;
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            let mut entry = StageTraceEntry {
                stage,
                attempt,
                duration_ms,
                success: false,
                model: model.clone().unwrap_or_else(|| FALLBACK_MODEL_LABEL.to_string()),
                error_code: None,
                input_tokens: Some(input_estimate),
                output_tokens: None,
                total_tokens: Some(input_estimate),
                token_alert: false,
                raw_input: Some(raw_input),
                raw_output: None,
            };

            let outcome = match response {
                Ok(response) => {
                    let usage = response.usage.unwrap_or(TokenUsage {
                        input_tokens: input_estimate,
                        output_tokens: estimate_tokens(&response.text),
                        total_tokens: None,
                    });
                    let total = usage
                        .total_tokens
                        .unwrap_or(usage.input_tokens.saturating_add(usage.output_tokens));

                    if let Some(resolved) = response.model.filter(|name| !name.is_empty()) {
                        entry.model = resolved;
                    }
                    entry.input_tokens = Some(usage.input_tokens);
                    entry.output_tokens = Some(usage.output_tokens);
                    entry.total_tokens = Some(total);
                    entry.raw_output = Some(response.text.clone());

                    if total > self.settings.token_alert_threshold {
                        entry.token_alert = true;
                        warn!(
                            event_name = "pipeline.stage.token_alert",
                            pipeline_id = self.pipeline_id,
                            trace_id = self.trace_id,
                            stage = stage.as_str(),
                            attempt,
                            total_tokens = total,
                            threshold = self.settings.token_alert_threshold,
                            "stage token usage above alert threshold"
                        );
                    }

                    parse(&response.text).map_err(|error| AttemptFailure {
                        code: StageErrorCode::InvalidJsonContract,
                        message: error.message,
                    })
                }
                Err(error) => Err(AttemptFailure {
                    code: if is_model_unavailable(&error) {
                        StageErrorCode::ModelUnavailable
                    } else {
                        StageErrorCode::StageFailed
                    },
                    message: format!("{error:#}"),
                }),
            };

            match outcome {
                Ok(parsed) => {
                    entry.success = true;
                    trace.push(entry);
                    debug!(
                        event_name = "pipeline.stage.completed",
                        pipeline_id = self.pipeline_id,
                        trace_id = self.trace_id,
                        stage = stage.as_str(),
                        attempt,
                        "stage output accepted"
                    );
                    return Ok(parsed);
                }
                Err(failure) => {
                    entry.error_code = Some(failure.code.as_str().to_string());
                    trace.push(entry);
                    warn!(
                        event_name = "pipeline.stage.attempt_failed",
                        pipeline_id = self.pipeline_id,
                        trace_id = self.trace_id,
                        stage = stage.as_str(),
                        attempt,
                        max_attempts,
                        error_code = failure.code.as_str(),
                        error = %failure.message,
                        "stage attempt failed"
                    );
                    last_error = Some(failure);
                }
            }
        }

        let failure = last_error.unwrap_or(AttemptFailure {
            code: StageErrorCode::StageFailed,
            message: "stage produced no attempts".to_string(),
        });

        Err(StageExecutionError {
            stage,
            code: failure.code,
            message: failure.message,
            attempts: max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use stagewise_core::errors::{ContractError, StageErrorCode};
    use stagewise_core::models::{ModelRole, StaticModelResolver};
    use stagewise_core::trace::{Stage, StageTrace};

    use super::{estimate_tokens, RunnerSettings, StageRunner};
    use crate::llm::{ChatMessage, ChatResponse, TokenUsage};
    use crate::scripted::ScriptedModelChat;

    fn settings(max_attempts: u32) -> RunnerSettings {
        RunnerSettings { max_attempts, ..RunnerSettings::default() }
    }

    fn messages(attempt: u32, last_error: Option<&str>) -> Vec<ChatMessage> {
        vec![ChatMessage::user(format!("attempt={attempt} previous={}", last_error.unwrap_or("-")))]
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[tokio::test]
    async fn always_invalid_output_exhausts_every_attempt() {
        let chat = ScriptedModelChat::new().with_default_reply("not json");
        let resolver = StaticModelResolver::new(Some("llama3.1".to_string()));
        let runner = StageRunner::new(&chat, &resolver, settings(3), "pipeline_1_user", "trace-1");
        let mut trace = StageTrace::new();

        let error = runner
            .run(ModelRole::Planner, None, &mut trace, messages, |_| {
                Err::<(), _>(ContractError::new("always wrong"))
            })
            .await
            .expect_err("parser never accepts");

        assert_eq!(error.code, StageErrorCode::InvalidJsonContract);
        assert_eq!(error.attempts, 3);
        assert_eq!(error.stage, Stage::Planner);
        assert_eq!(trace.len(), 3);
        assert!(trace.entries().iter().all(|entry| !entry.success));
        assert_eq!(chat.calls_for(ModelRole::Planner), 3);
    }

    #[tokio::test]
    async fn retry_feeds_previous_error_into_next_prompt() {
        let chat = ScriptedModelChat::new()
            .with_reply(ModelRole::Finalizer, "{}")
            .with_reply(ModelRole::Finalizer, r#"{"message":"ok"}"#);
        let resolver = StaticModelResolver::default();
        let runner = StageRunner::new(&chat, &resolver, settings(2), "pipeline_1_user", "trace-1");
        let mut trace = StageTrace::new();

        let message = runner
            .run(ModelRole::Finalizer, None, &mut trace, messages, |raw| {
                stagewise_core::contracts::parse_finalization(raw).map(|final_| final_.message)
            })
            .await
            .expect("second attempt succeeds");

        assert_eq!(message, "ok");
        let recorded = chat.recorded_calls();
        assert!(recorded[1].messages[0].content.contains("attempt=2"));
        assert!(recorded[1].messages[0].content.contains("message"));
        assert_eq!(trace.entries()[0].error_code.as_deref(), Some("invalid_json_contract"));
        assert!(trace.entries()[1].success);
        assert_eq!(trace.entries()[1].model, "default");
    }

    #[tokio::test]
    async fn timeouts_are_classified_as_model_unavailable() {
        let chat = ScriptedModelChat::new()
            .with_error(ModelRole::RequestManager, anyhow!("request timed out"))
            .with_error(ModelRole::RequestManager, anyhow!("request timed out"));
        let resolver = StaticModelResolver::default();
        let runner = StageRunner::new(&chat, &resolver, settings(2), "pipeline_1_user", "trace-1");
        let mut trace = StageTrace::new();

        let error = runner
            .run(ModelRole::RequestManager, None, &mut trace, messages, |_| Ok(()))
            .await
            .expect_err("backend unreachable");

        assert_eq!(error.code, StageErrorCode::ModelUnavailable);
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.entries()[1].error_code.as_deref(), Some("model_unavailable"));
    }

    #[tokio::test]
    async fn reported_usage_above_threshold_raises_token_alert() {
        let chat = ScriptedModelChat::new().with_response(
            ModelRole::Aggregator,
            ChatResponse {
                text: "{}".to_string(),
                model: Some("qwen2.5".to_string()),
                usage: Some(TokenUsage {
                    input_tokens: 15_000,
                    output_tokens: 1_500,
                    total_tokens: None,
                }),
            },
        );
        let resolver = StaticModelResolver::default();
        let runner = StageRunner::new(&chat, &resolver, settings(1), "pipeline_1_user", "trace-1");
        let mut trace = StageTrace::new();

        runner
            .run(ModelRole::Aggregator, None, &mut trace, messages, |_| Ok(()))
            .await
            .expect("accepted");

        let entry = &trace.entries()[0];
        assert!(entry.token_alert);
        assert_eq!(entry.total_tokens, Some(16_500));
        assert_eq!(entry.model, "qwen2.5");
    }
}
