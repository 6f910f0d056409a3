//! Completion model abstraction and the retrieval-augmented chat service.
//!
//! - [`CompletionModel`] sends role-tagged messages to a hosted chat model.
//!   [`OpenAIChat`] talks to an OpenAI-compatible `/chat/completions`
//!   endpoint; [`DisabledChat`] always errors.
//! - [`ChatService`] is what a [`Session`](crate::session::Session) calls.
//!   [`RagChat`] retrieves scoped context from the tenant's namespace,
//!   renders it into a system prompt, and asks the model for a reply.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::ChatConfig;
use crate::http::post_json_with_retry;
use crate::index::VectorIndex;
use crate::models::{ContextChunk, ConversationTurn, Role};
use crate::scope::RetrievalScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

impl From<Role> for PromptRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => PromptRole::User,
            Role::Assistant => PromptRole::Assistant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::System,
            content: content.into(),
        }
    }
}

impl From<&ConversationTurn> for PromptMessage {
    fn from(turn: &ConversationTurn) -> Self {
        Self {
            role: turn.role.into(),
            content: turn.content.clone(),
        }
    }
}

/// Sampling parameters passed with every completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelParams {
    pub model: String,
    pub temperature: f32,
    pub seed: Option<i64>,
}

impl From<&ChatConfig> for ModelParams {
    fn from(config: &ChatConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            seed: config.seed,
        }
    }
}

impl Default for ModelParams {
    fn default() -> Self {
        Self::from(&ChatConfig::default())
    }
}

/// A hosted chat/completion backend.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, messages: &[PromptMessage], params: &ModelParams) -> Result<String>;
}

/// Produces the assistant reply for a conversation.
///
/// `turns` ends with the pending user turn. Implementations must not
/// retrieve context outside `namespace` or `scope`.
#[async_trait]
pub trait ChatService: Send + Sync {
    async fn chat(
        &self,
        namespace: &str,
        turns: &[ConversationTurn],
        scope: &RetrievalScope,
        params: &ModelParams,
    ) -> Result<String>;
}

// ============ Disabled Provider ============

pub struct DisabledChat;

#[async_trait]
impl CompletionModel for DisabledChat {
    async fn complete(&self, _messages: &[PromptMessage], _params: &ModelParams) -> Result<String> {
        bail!("Chat is disabled. Set [chat] provider in config.")
    }
}

// ============ OpenAI Provider ============

/// Completion model using an OpenAI-compatible API.
///
/// Requires `OPENAI_API_KEY` in the environment.
pub struct OpenAIChat {
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIChat {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl CompletionModel for OpenAIChat {
    async fn complete(&self, messages: &[PromptMessage], params: &ModelParams) -> Result<String> {
        let mut body = serde_json::json!({
            "model": params.model,
            "temperature": params.temperature,
            "messages": messages,
        });
        if let Some(seed) = params.seed {
            body["seed"] = serde_json::json!(seed);
        }
        let json = post_json_with_retry(
            &self.client,
            &self.url,
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        parse_completion(&json)
    }
}

/// Extract `choices[0].message.content` from a chat completion response.
fn parse_completion(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Invalid completion response: missing choices[0].message.content"))
}

pub fn create_completion_model(config: &ChatConfig) -> Result<Arc<dyn CompletionModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledChat)),
        "openai" => Ok(Arc::new(OpenAIChat::new(config)?)),
        other => bail!("Unknown chat provider: {}", other),
    }
}

// ============ Retrieval-augmented chat ============

pub struct RagChat {
    index: Arc<dyn VectorIndex>,
    model: Arc<dyn CompletionModel>,
    top_k: usize,
}

impl RagChat {
    pub fn new(index: Arc<dyn VectorIndex>, model: Arc<dyn CompletionModel>, top_k: usize) -> Self {
        Self {
            index,
            model,
            top_k,
        }
    }
}

#[async_trait]
impl ChatService for RagChat {
    async fn chat(
        &self,
        namespace: &str,
        turns: &[ConversationTurn],
        scope: &RetrievalScope,
        params: &ModelParams,
    ) -> Result<String> {
        let question = turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.as_str())
            .ok_or_else(|| anyhow::anyhow!("conversation has no user turn"))?;

        let chunks = self
            .index
            .query(namespace, scope, question, self.top_k)
            .await?;
        debug!(namespace, chunks = chunks.len(), "retrieved context");

        let mut messages = Vec::with_capacity(turns.len() + 1);
        messages.push(PromptMessage::system(system_prompt(&chunks)));
        messages.extend(turns.iter().map(PromptMessage::from));

        self.model.complete(&messages, params).await
    }
}

/// Render retrieved chunks into the system prompt.
pub fn system_prompt(chunks: &[ContextChunk]) -> String {
    let mut prompt = String::from(
        "You answer questions about the user's documents using only the context below.\n\
         After each fact, cite where it came from exactly as `Source: <title>: page <n>`.\n\
         If the context does not contain the answer, say so.\n",
    );
    if chunks.is_empty() {
        prompt.push_str("\nNo context was retrieved.\n");
        return prompt;
    }
    prompt.push_str("\nContext:\n");
    for chunk in chunks {
        prompt.push_str("---\n");
        prompt.push_str(&format!("Source: {}\n", chunk.source));
        prompt.push_str(chunk.text.trim());
        prompt.push('\n');
    }
    prompt
}
