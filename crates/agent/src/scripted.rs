//! Deterministic [`ModelChat`] double driven by per-role reply queues.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use stagewise_core::models::ModelRole;

use crate::llm::{ChatMessage, ChatOptions, ChatResponse, ModelChat};

enum ScriptedReply {
    Response(ChatResponse),
    Error(anyhow::Error),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedCall {
    pub role: ModelRole,
    pub messages: Vec<ChatMessage>,
    pub options: ChatOptions,
}

#[derive(Default)]
pub struct ScriptedModelChat {
    queues: Mutex<HashMap<ModelRole, VecDeque<ScriptedReply>>>,
    default_reply: Option<String>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedModelChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, role: ModelRole, text: impl Into<String>) -> Self {
        self.with_response(role, ChatResponse::text(text))
    }

    pub fn with_response(self, role: ModelRole, response: ChatResponse) -> Self {
        self.enqueue(role, ScriptedReply::Response(response));
        self
    }

    pub fn with_error(self, role: ModelRole, error: anyhow::Error) -> Self {
        self.enqueue(role, ScriptedReply::Error(error));
        self
    }

    /// Reply used by any role whose queue is empty.
    pub fn with_default_reply(mut self, text: impl Into<String>) -> Self {
        self.default_reply = Some(text.into());
        self
    }

    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn calls_for(&self, role: ModelRole) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|call| call.role == role)
            .count()
    }

    pub fn remaining(&self, role: ModelRole) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&role)
            .map_or(0, VecDeque::len)
    }

    fn enqueue(&self, role: ModelRole, reply: ScriptedReply) {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(role)
            .or_default()
            .push_back(reply);
    }
}

#[async_trait]
impl ModelChat for ScriptedModelChat {
    async fn chat(
        &self,
        role: ModelRole,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(RecordedCall {
            role,
            messages: messages.to_vec(),
            options: options.clone(),
        });

        let next = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&role)
            .and_then(VecDeque::pop_front);

        match next {
            Some(ScriptedReply::Response(response)) => Ok(response),
            Some(ScriptedReply::Error(error)) => Err(error),
            None => match &self.default_reply {
                Some(text) => Ok(ChatResponse::text(text.clone())),
                None => Err(anyhow!("no scripted reply left for role `{role}`")),
            },
        }
    }
}
