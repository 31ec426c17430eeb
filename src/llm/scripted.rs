//! Deterministic provider for tests and offline development.
//!
//! Replies are scripted up front and consumed one per generation, streamed
//! in line-sized chunks so mid-stream tool detection behaves as it does
//! against a live server. A step can also be scripted to hang after a few
//! chunks, which is how interruption is exercised.

use super::{ModelMeta, Provider, TokenStream};
use crate::message::Message;
use crate::tools::ToolRegistry;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// One scripted generation.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Stream this reply to completion.
    Reply(String),
    /// Emit these chunks, then block until cancelled or dropped.
    HangAfter(Vec<String>),
}

/// Provider that replays a fixed script.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<ScriptStep>>,
}

impl ScriptedProvider {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
        }
    }

    /// Provider scripted with a single reply.
    pub fn replying(reply: impl Into<String>) -> Self {
        Self::new([ScriptStep::Reply(reply.into())])
    }

    /// Appends another step to the script.
    pub fn push(&self, step: ScriptStep) {
        self.steps.lock().unwrap().push_back(step);
    }

    fn next_step(&self) -> ScriptStep {
        self.steps
            .lock()
            .unwrap()
            .pop_front()
            // An exhausted script keeps answering with silence.
            .unwrap_or_else(|| ScriptStep::Reply(String::new()))
    }

    /// Splits a reply into streaming chunks at line granularity.
    fn chunk(reply: &str) -> Vec<String> {
        reply.split_inclusive('\n').map(str::to_string).collect()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn chat(
        &self,
        _messages: &[Message],
        _model: &ModelMeta,
        _tools: Option<&ToolRegistry>,
    ) -> crate::Result<String> {
        match self.next_step() {
            ScriptStep::Reply(reply) => Ok(reply),
            ScriptStep::HangAfter(_) => std::future::pending().await,
        }
    }

    async fn stream(
        &self,
        _messages: &[Message],
        _model: &ModelMeta,
        _tools: Option<&ToolRegistry>,
    ) -> crate::Result<TokenStream> {
        let step = self.next_step();
        Ok(Box::pin(async_stream::stream! {
            match step {
                ScriptStep::Reply(reply) => {
                    for chunk in ScriptedProvider::chunk(&reply) {
                        yield Ok(chunk);
                    }
                }
                ScriptStep::HangAfter(chunks) => {
                    for chunk in chunks {
                        yield Ok(chunk);
                    }
                    let () = std::future::pending().await;
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn meta() -> ModelMeta {
        ModelMeta::new("local", "scripted", 8_000)
    }

    #[tokio::test]
    async fn test_replies_in_order() {
        let provider = ScriptedProvider::new([
            ScriptStep::Reply("first".into()),
            ScriptStep::Reply("second".into()),
        ]);
        assert_eq!(provider.chat(&[], &meta(), None).await.unwrap(), "first");
        assert_eq!(provider.chat(&[], &meta(), None).await.unwrap(), "second");
        // Exhausted scripts answer with silence.
        assert_eq!(provider.chat(&[], &meta(), None).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_stream_chunks_at_lines() {
        let provider = ScriptedProvider::replying("line one\nline two");
        let stream = provider.stream(&[], &meta(), None).await.unwrap();
        let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks, vec!["line one\n", "line two"]);
    }

    #[tokio::test]
    async fn test_hang_after_emits_then_pends() {
        let provider = ScriptedProvider::new([ScriptStep::HangAfter(vec![
            "a".into(),
            "b".into(),
        ])]);
        let mut stream = provider.stream(&[], &meta(), None).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert_eq!(stream.next().await.unwrap().unwrap(), "b");

        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            stream.next(),
        )
        .await;
        assert!(pending.is_err());
    }
}
