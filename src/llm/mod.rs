//! Boundary to the LLM collaborator.
//!
//! The pipeline only ever sees [`LlmClient`]: one chat-completion attempt in,
//! raw assistant text out. Retry, timeouts and schema enforcement are layered
//! on top in [`retry`] and [`tool`], so a scripted client in tests exercises
//! exactly the same paths as the HTTP one.

pub mod openai;
pub mod retry;
pub mod tool;

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use crate::error::LlmCallError;
use crate::types::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage { role: Role::Assistant, content: content.into() }
    }
}

/// One chat-completion request. `tool` names the prompt that produced it; it
/// is bookkeeping only and never sent over the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub tool: &'static str,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
}

pub trait LlmClient: Send + Sync {
    /// A single attempt. Implementations classify failures but never retry.
    fn complete(
        &self,
        request: &LlmRequest,
    ) -> impl Future<Output = Result<String, LlmCallError>> + Send;
}

impl<C: LlmClient> LlmClient for Arc<C> {
    fn complete(
        &self,
        request: &LlmRequest,
    ) -> impl Future<Output = Result<String, LlmCallError>> + Send {
        (**self).complete(request)
    }
}

/// One prompt/response pair as it went over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub stage: Stage,
    pub tool: String,
    pub attempt: u32,
    pub prompt: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
}

/// Append-only log of every exchange made for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    exchanges: Vec<Exchange>,
}

impl Transcript {
    pub fn record(&mut self, exchange: Exchange) {
        self.exchanges.push(exchange);
    }

    /// Appends another transcript's exchanges after this one's.
    pub fn append(&mut self, other: Transcript) {
        self.exchanges.extend(other.exchanges);
    }

    pub fn exchanges(&self) -> &[Exchange] {
        &self.exchanges
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}
