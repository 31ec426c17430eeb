//! OpenAI-compatible chat completions adapter.
//!
//! Speaks the `/chat/completions` wire format used by OpenAI and by local
//! inference servers (LM Studio, Ollama, llama.cpp, vLLM). Streaming
//! responses arrive as SSE; tool calls arrive as incremental deltas that
//! must be reassembled before they are usable.
//!
//! Tool-call deltas are aggregated per index and, once a `finish_reason`
//! arrives, re-emitted into the text stream as `\n@<name>(<id>): <json>`
//! lines. Consumers therefore see one uniform text stream regardless of
//! whether the model used markdown blocks or native calls.

use super::{ModelMeta, Provider, RetryPolicy, TokenStream, retry_transient};
use crate::message::{Message, Role};
use crate::tools::ToolRegistry;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// OpenAI-compatible provider.
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl OpenAiProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(Error::Http)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            retry: RetryPolicy::default(),
        })
    }

    /// Endpoint and credentials for a provider key.
    ///
    /// - `openai`: `https://api.openai.com/v1`, `OPENAI_API_KEY`
    /// - `anthropic`: OpenAI-compatible endpoint, `ANTHROPIC_API_KEY`
    /// - anything else: local server at `OPENAI_BASE_URL` (default LM
    ///   Studio's `http://localhost:1234/v1`), no key needed
    pub fn from_env(provider: &str) -> Result<Self> {
        let (base_url, api_key) = match provider {
            "openai" => (
                "https://api.openai.com/v1".to_string(),
                std::env::var("OPENAI_API_KEY")
                    .map_err(|_| Error::config("OPENAI_API_KEY is not set"))?,
            ),
            "anthropic" => (
                "https://api.anthropic.com/v1".to_string(),
                std::env::var("ANTHROPIC_API_KEY")
                    .map_err(|_| Error::config("ANTHROPIC_API_KEY is not set"))?,
            ),
            _ => (
                std::env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "http://localhost:1234/v1".to_string()),
                std::env::var("OPENAI_API_KEY").unwrap_or_else(|_| "not-needed".to_string()),
            ),
        };
        Self::new(base_url, api_key)
    }

    async fn send_request(&self, request: &WireRequest) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        retry_transient(&self.retry, || async {
            let response = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(request)
                .send()
                .await
                .map_err(Error::Http)?;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            if status.is_server_error() || status.as_u16() == 429 {
                Err(Error::llm_transient(format!("{status}: {body}")))
            } else {
                Err(Error::llm_permanent(format!("{status}: {body}")))
            }
        })
        .await
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn chat(
        &self,
        messages: &[Message],
        model: &ModelMeta,
        tools: Option<&ToolRegistry>,
    ) -> Result<String> {
        let request = WireRequest::build(messages, model, tools, false);
        let response = self.send_request(&request).await?;
        let parsed: WireResponse = response.json().await.map_err(Error::Http)?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::llm_permanent("response contained no choices"))?;

        let mut output = choice.message.content.unwrap_or_default();
        for call in choice.message.tool_calls.unwrap_or_default() {
            output.push_str(&format!(
                "\n@{}({}): {}",
                call.function.name, call.id, call.function.arguments
            ));
        }
        Ok(output)
    }

    async fn stream(
        &self,
        messages: &[Message],
        model: &ModelMeta,
        tools: Option<&ToolRegistry>,
    ) -> Result<TokenStream> {
        let request = WireRequest::build(messages, model, tools, true);
        let response = self.send_request(&request).await?;
        let mut bytes = response.bytes_stream();

        Ok(Box::pin(async_stream::try_stream! {
            let mut aggregator = ToolCallAggregator::new();
            let mut buffer = String::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(Error::Http)?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE events are newline-delimited; HTTP chunks can split
                // them anywhere, so only complete lines are parsed.
                while let Some(pos) = buffer.find('\n') {
                    let line: String = buffer.drain(..=pos).collect();
                    let line = line.trim();
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        continue;
                    }
                    let parsed: WireChunk = serde_json::from_str(data)
                        .map_err(|e| Error::llm_permanent(format!("bad stream chunk: {e}")))?;
                    for text in aggregator.process_chunk(parsed) {
                        yield text;
                    }
                }
            }
        }))
    }
}

// Wire format
// -----------

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Serialize, PartialEq)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl WireRequest {
    fn build(
        messages: &[Message],
        model: &ModelMeta,
        tools: Option<&ToolRegistry>,
        stream: bool,
    ) -> Self {
        Self {
            model: model.model.clone(),
            messages: to_wire_messages(messages, tools.is_some()),
            stream,
            max_tokens: Some(model.max_output),
            tools: tools.map(tool_schemas).filter(|t| !t.is_empty()),
        }
    }
}

/// Converts messages to the wire shape, merging consecutive same-role
/// messages as some providers require.
fn to_wire_messages(messages: &[Message], native_tools: bool) -> Vec<WireMessage> {
    let mut wire: Vec<WireMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        let (role, tool_call_id): (&'static str, Option<String>) = match msg.role {
            Role::System => ("system", None),
            Role::User => ("user", None),
            Role::Assistant => ("assistant", None),
            // Tool results are only a first-class role when native tool
            // calls are in play; otherwise they ride along as system text.
            Role::Tool if native_tools && msg.call_id.is_some() => {
                ("tool", msg.call_id.clone())
            }
            Role::Tool => ("system", None),
        };

        match wire.last_mut() {
            Some(last) if last.role == role && last.tool_call_id.is_none() && tool_call_id.is_none() => {
                last.content.push_str("\n\n");
                last.content.push_str(&msg.content);
            }
            _ => wire.push(WireMessage {
                role,
                content: msg.content.clone(),
                tool_call_id,
            }),
        }
    }
    wire
}

/// Translates the registry into the provider's function-calling schema.
fn tool_schemas(registry: &ToolRegistry) -> Vec<serde_json::Value> {
    registry
        .available_tools()
        .map(|spec| {
            let mut properties = serde_json::Map::new();
            let mut required = Vec::new();
            for param in &spec.parameters {
                properties.insert(
                    param.name.clone(),
                    serde_json::json!({
                        "type": param.type_,
                        "description": param.description,
                    }),
                );
                if param.required {
                    required.push(param.name.clone());
                }
            }
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": spec.name,
                    "description": spec.desc,
                    "parameters": {
                        "type": "object",
                        "properties": properties,
                        "required": required,
                    },
                },
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireResponseChoice>,
}

#[derive(Debug, Deserialize)]
struct WireResponseChoice {
    message: WireResponseMessage,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireChunk {
    pub choices: Vec<WireChunkChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireChunkChoice {
    pub delta: WireDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WireDelta {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireFunctionDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Reassembles tool calls that arrive as interleaved deltas.
///
/// Text deltas pass straight through; tool-call fragments accumulate per
/// index until a `finish_reason` arrives, at which point each completed
/// call is emitted as a synthetic `\n@<name>(<id>): <json>` chunk.
#[derive(Default)]
pub(crate) struct ToolCallAggregator {
    tool_calls: BTreeMap<u32, PartialToolCall>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl ToolCallAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_chunk(&mut self, chunk: WireChunk) -> Vec<String> {
        let mut out = Vec::new();

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    out.push(content);
                }
            }

            if let Some(deltas) = choice.delta.tool_calls {
                for delta in deltas {
                    let entry = self.tool_calls.entry(delta.index).or_default();
                    if let Some(id) = delta.id {
                        entry.id = Some(id);
                    }
                    if let Some(function) = delta.function {
                        if let Some(name) = function.name {
                            entry.name = Some(name);
                        }
                        if let Some(arguments) = function.arguments {
                            entry.arguments.push_str(&arguments);
                        }
                    }
                }
            }

            if choice.finish_reason.is_some() {
                for (_, partial) in std::mem::take(&mut self.tool_calls) {
                    // Calls missing an id or name were corrupted in
                    // transit; drop them rather than invent identifiers.
                    if let (Some(id), Some(name)) = (partial.id, partial.name) {
                        let arguments = if partial.arguments.is_empty() {
                            "{}".to_string()
                        } else {
                            partial.arguments
                        };
                        out.push(format!("\n@{name}({id}): {arguments}\n"));
                    }
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(json: serde_json::Value) -> WireChunk {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_text_deltas_pass_through() {
        let mut agg = ToolCallAggregator::new();
        let out = agg.process_chunk(chunk(serde_json::json!({
            "choices": [{"delta": {"content": "Hello "}, "finish_reason": null}]
        })));
        assert_eq!(out, vec!["Hello "]);
    }

    #[test]
    fn test_tool_call_deltas_aggregate() {
        let mut agg = ToolCallAggregator::new();

        let out = agg.process_chunk(chunk(serde_json::json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_123", "function": {"name": "shell", "arguments": "{\"code\":"}}
            ]}, "finish_reason": null}]
        })));
        assert!(out.is_empty());

        let out = agg.process_chunk(chunk(serde_json::json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": " \"ls\"}"}}
            ]}, "finish_reason": "tool_calls"}]
        })));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], "\n@shell(call_123): {\"code\": \"ls\"}\n");
    }

    #[test]
    fn test_multiple_interleaved_tool_calls() {
        let mut agg = ToolCallAggregator::new();
        agg.process_chunk(chunk(serde_json::json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "a", "function": {"name": "shell", "arguments": "{}"}},
                {"index": 1, "id": "b", "function": {"name": "python", "arguments": "{}"}}
            ]}, "finish_reason": null}]
        })));
        let out = agg.process_chunk(chunk(serde_json::json!({
            "choices": [{"delta": {}, "finish_reason": "tool_calls"}]
        })));
        assert_eq!(out.len(), 2);
        assert!(out[0].contains("@shell(a)"));
        assert!(out[1].contains("@python(b)"));
    }

    #[test]
    fn test_incomplete_tool_call_dropped() {
        let mut agg = ToolCallAggregator::new();
        agg.process_chunk(chunk(serde_json::json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"x\": 1}"}}
            ]}, "finish_reason": null}]
        })));
        let out = agg.process_chunk(chunk(serde_json::json!({
            "choices": [{"delta": {}, "finish_reason": "stop"}]
        })));
        assert!(out.is_empty());
    }

    #[test]
    fn test_wire_messages_merge_consecutive_roles() {
        let msgs = vec![
            Message::system("a"),
            Message::system("b"),
            Message::user("q"),
            Message::tool("output", "call_1"),
        ];
        let wire = to_wire_messages(&msgs, false);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0].content, "a\n\nb");
        // Tool results ride as system text in markdown mode.
        assert_eq!(wire[2].role, "system");
    }

    #[test]
    fn test_wire_messages_native_tool_role() {
        let msgs = vec![Message::tool("output", "call_1")];
        let wire = to_wire_messages(&msgs, true);
        assert_eq!(wire[0].role, "tool");
        assert_eq!(wire[0].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_tool_schemas_shape() {
        let registry = crate::tools::test_registry();
        let schemas = tool_schemas(&registry);
        assert_eq!(schemas.len(), registry.len());
        let shell = &schemas[0];
        assert_eq!(shell["function"]["name"], "shell");
        assert_eq!(shell["function"]["parameters"]["type"], "object");
        assert!(shell["function"]["parameters"]["properties"]["code"].is_object());
    }

    #[test]
    fn test_request_omits_empty_tools() {
        let meta = ModelMeta::new("local", "m", 1000);
        let request = WireRequest::build(&[Message::user("hi")], &meta, None, true);
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("tools").is_none());
        assert_eq!(json["stream"], true);
    }
}
