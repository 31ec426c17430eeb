//! HTTP/SSE server: shared state and router.

pub mod api;
pub mod session;

pub use session::{Event, MessageView, SessionManager, ToolExecution, ToolStatus};

use crate::llm::Provider;
use crate::reduce::TokenCounter;
use crate::tools::ToolRegistry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Shared server state.
///
/// Conversation mutation is serialised through per-conversation async
/// mutexes; sessions of different conversations run fully in parallel.
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub registry: Arc<ToolRegistry>,
    pub provider: Arc<dyn Provider>,
    pub counter: Arc<dyn TokenCounter>,
    pub logs_home: PathBuf,
    /// Model id used when a step does not name one.
    pub default_model: String,
    conversation_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AppState {
    pub fn new(
        registry: Arc<ToolRegistry>,
        provider: Arc<dyn Provider>,
        counter: Arc<dyn TokenCounter>,
        logs_home: PathBuf,
        default_model: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: SessionManager::new(),
            registry,
            provider,
            counter,
            logs_home,
            default_model,
            conversation_locks: Mutex::new(HashMap::new()),
        })
    }

    /// The async mutex serialising all log mutation for one conversation.
    pub fn conversation_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.conversation_locks
            .lock()
            .unwrap()
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    pub fn logdir(&self, conversation_id: &str) -> PathBuf {
        self.logs_home.join(conversation_id)
    }
}

/// Builds the v2 API router.
pub fn router(state: Arc<AppState>) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/api/v2", get(api::api_root))
        .route("/api/v2/conversations", get(api::list_conversations))
        .route(
            "/api/v2/conversations/{conversation_id}",
            get(api::get_conversation)
                .put(api::create_conversation)
                .post(api::append_message),
        )
        .route(
            "/api/v2/conversations/{conversation_id}/session",
            post(api::create_session),
        )
        .route(
            "/api/v2/conversations/{conversation_id}/events",
            get(api::events),
        )
        .route(
            "/api/v2/conversations/{conversation_id}/step",
            post(api::step),
        )
        .route(
            "/api/v2/conversations/{conversation_id}/tool/confirm",
            post(api::tool_confirm),
        )
        .route(
            "/api/v2/conversations/{conversation_id}/interrupt",
            post(api::interrupt),
        )
        .with_state(state)
}
