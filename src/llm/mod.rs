//! LLM provider contract and implementations.
//!
//! The core consumes providers through the [`Provider`] trait: a
//! non-streaming `chat` and a `stream` of text chunks. When the underlying
//! API reports a structured tool call, the stream injects a synthetic chunk
//! of the form `\n@<toolname>(<call_id>): ` followed by the JSON argument
//! text, so downstream consumers only ever deal with text.

pub mod models;
pub mod openai;
pub mod retry;
pub mod scripted;

pub use models::{ModelMeta, default_model, get_model};
pub use openai::OpenAiProvider;
pub use retry::{RetryPolicy, retry_transient};
pub use scripted::{ScriptStep, ScriptedProvider};

use crate::message::Message;
use crate::tools::ToolRegistry;
use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;
use std::sync::Arc;

/// Stream of text chunks from a model.
pub type TokenStream = Pin<Box<dyn Stream<Item = crate::Result<String>> + Send>>;

/// What the agent loops need from an LLM backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Non-streaming completion. Returns the full assistant reply,
    /// including any serialised tool calls.
    async fn chat(
        &self,
        messages: &[Message],
        model: &ModelMeta,
        tools: Option<&ToolRegistry>,
    ) -> crate::Result<String>;

    /// Streaming completion.
    async fn stream(
        &self,
        messages: &[Message],
        model: &ModelMeta,
        tools: Option<&ToolRegistry>,
    ) -> crate::Result<TokenStream>;
}

/// Resolves the provider for a model's provider key.
///
/// All supported backends speak the OpenAI-compatible chat completions
/// API; they differ only in endpoint and credentials.
pub fn provider_for(meta: &ModelMeta) -> crate::Result<Arc<dyn Provider>> {
    Ok(Arc::new(OpenAiProvider::from_env(&meta.provider)?))
}
