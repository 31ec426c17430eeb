//! Model metadata: capabilities and context windows.
//!
//! Model ids are `provider/name`, e.g. `openai/gpt-4o` or
//! `local/qwen2.5-32b-instruct`. Unknown models get conservative defaults
//! for their provider.

use serde::{Deserialize, Serialize};

/// Capability flags and limits for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMeta {
    /// Provider key (`openai`, `anthropic`, `local`, ...).
    pub provider: String,
    /// Model name within the provider.
    pub model: String,
    /// Context window in tokens.
    pub context: usize,
    /// Maximum output tokens per response.
    pub max_output: usize,
    pub supports_streaming: bool,
    pub supports_vision: bool,
}

impl ModelMeta {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, context: usize) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            context,
            max_output: 4096,
            supports_streaming: true,
            supports_vision: false,
        }
    }

    /// Full id, `provider/name`.
    pub fn full(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

/// Known models. Sparse on purpose: lookups fall back to provider
/// defaults, so new model names keep working without a release.
fn known_models() -> Vec<ModelMeta> {
    vec![
        ModelMeta {
            supports_vision: true,
            max_output: 16_384,
            ..ModelMeta::new("openai", "gpt-4o", 128_000)
        },
        ModelMeta {
            supports_vision: true,
            ..ModelMeta::new("openai", "gpt-4o-mini", 128_000)
        },
        ModelMeta {
            supports_vision: true,
            max_output: 8_192,
            ..ModelMeta::new("anthropic", "claude-3-5-sonnet-20241022", 200_000)
        },
        ModelMeta::new("anthropic", "claude-3-5-haiku-20241022", 200_000),
        // o1 does not stream.
        ModelMeta {
            supports_streaming: false,
            max_output: 32_768,
            ..ModelMeta::new("openai", "o1", 200_000)
        },
    ]
}

fn provider_default_context(provider: &str) -> usize {
    match provider {
        "openai" => 128_000,
        "anthropic" => 200_000,
        // Local servers vary widely; assume a modest window.
        _ => 32_768,
    }
}

/// Resolves a `provider/name` id to metadata.
///
/// Ids without a slash are treated as local models.
pub fn get_model(id: &str) -> ModelMeta {
    let (provider, name) = id
        .split_once('/')
        .unwrap_or(("local", id));

    known_models()
        .into_iter()
        .find(|meta| meta.provider == provider && meta.model == name)
        .unwrap_or_else(|| ModelMeta::new(provider, name, provider_default_context(provider)))
}

/// The default model id from the `MODEL` env var, if set.
pub fn default_model() -> Option<String> {
    std::env::var("MODEL").ok().filter(|v| !v.is_empty())
}
