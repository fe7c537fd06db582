//! Test doubles for the two external seams actions depend on: the LLM
//! provider and the inbox watcher.
//!
//! Useful in unit and integration tests where a real provider or mailbox is
//! either unavailable or irrelevant.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::ai::{AiResult, AiTask, LlmProvider, TokenUsage};
use crate::mail::{InboxMessage, InboxWaitRequest, InboxWatch};
use crate::NodeError;

/// What [`MockProvider`] does with each task.
pub enum MockReply {
    Content(String),
    Fail(String),
}

/// An LLM provider that records every task it receives.
pub struct MockProvider {
    reply: MockReply,
    tasks: Arc<Mutex<Vec<AiTask>>>,
}

impl MockProvider {
    /// Always succeed with `content`.
    pub fn replying(content: impl Into<String>) -> Self {
        Self {
            reply: MockReply::Content(content.into()),
            tasks: Arc::default(),
        }
    }

    /// Always fail with a provider API error.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            reply: MockReply::Fail(message.into()),
            tasks: Arc::default(),
        }
    }

    pub fn call_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Every task seen so far, in call order.
    pub fn tasks(&self) -> Vec<AiTask> {
        self.tasks.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn complete(&self, task: &AiTask) -> Result<AiResult, NodeError> {
        self.tasks.lock().unwrap().push(task.clone());

        match &self.reply {
            MockReply::Content(content) => Ok(AiResult {
                success: true,
                content: content.clone(),
                usage: Some(TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                    total_tokens: 15,
                }),
                model: task.model.clone(),
                error: None,
            }),
            MockReply::Fail(message) => Err(NodeError::Api {
                service: "mock",
                message: message.clone(),
            }),
        }
    }
}

/// An inbox watcher that either hands out a fixed message or never answers.
pub struct MockInbox {
    message: Option<InboxMessage>,
    requests: Arc<Mutex<Vec<InboxWaitRequest>>>,
}

impl MockInbox {
    pub fn delivering(message: InboxMessage) -> Self {
        Self {
            message: Some(message),
            requests: Arc::default(),
        }
    }

    /// Never delivers; callers rely on their own deadline.
    pub fn silent() -> Self {
        Self {
            message: None,
            requests: Arc::default(),
        }
    }

    pub fn requests(&self) -> Vec<InboxWaitRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl InboxWatch for MockInbox {
    async fn wait_for_message(&self, request: InboxWaitRequest) -> Result<InboxMessage, NodeError> {
        self.requests.lock().unwrap().push(request);
        match &self.message {
            Some(message) => Ok(message.clone()),
            None => std::future::pending().await,
        }
    }
}
