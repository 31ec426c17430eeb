//! Session state for the HTTP API.
//!
//! A session is a server-side handle over one conversation: whether a
//! generation is in flight, which tools are awaiting confirmation, and the
//! ordered event list its SSE subscribers poll. One conversation can have
//! any number of sessions; events fan out to all of them.

use crate::interrupt::CancelToken;
use crate::message::Message;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Status of one tracked tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Executing,
    Completed,
    Skipped,
    Failed,
}

/// A tool invocation awaiting or undergoing execution.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub id: String,
    pub tool: String,
    pub args: Vec<String>,
    /// The invocation body shown to the client for confirmation.
    pub content: String,
    /// The full assistant output that produced this invocation; appended
    /// to the log when the tool is confirmed or skipped.
    pub assistant_content: String,
    pub status: ToolStatus,
    pub result: Option<String>,
    pub auto_confirm: bool,
    pub edited_content: Option<String>,
}

/// Trimmed message payload for event frames.
#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&Message> for MessageView {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role.to_string(),
            content: msg.content.clone(),
            timestamp: msg.timestamp,
        }
    }
}

/// Events broadcast to SSE subscribers, in append order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Connected {
        session_id: String,
    },
    Ping,
    MessageAdded {
        message: MessageView,
    },
    GenerationStarted,
    GenerationProgress {
        token: String,
    },
    GenerationComplete {
        message: MessageView,
    },
    GenerationResuming,
    ToolPending {
        tool_id: String,
        tool: String,
        args: Vec<String>,
        content: String,
        auto_confirm: bool,
    },
    ToolExecuting {
        tool_id: String,
    },
    ToolOutput {
        tool_id: String,
        output: MessageView,
    },
    ToolSkipped {
        tool_id: String,
    },
    ToolFailed {
        tool_id: String,
        error: String,
    },
    Interrupted,
    Error {
        error: String,
    },
}

/// One session.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub conversation_id: String,
    pub active: bool,
    pub generating: bool,
    pub last_activity: DateTime<Utc>,
    pub events: Vec<Event>,
    pub pending_tools: HashMap<String, ToolExecution>,
    pub auto_confirm_count: u32,
    pub clients: HashSet<String>,
    pub cancel: CancelToken,
    /// Model id the current/most recent step was started with.
    pub model: Option<String>,
    /// Branch the current/most recent step operates on.
    pub branch: String,
}

impl Session {
    fn new(conversation_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            active: true,
            generating: false,
            last_activity: Utc::now(),
            events: Vec::new(),
            pending_tools: HashMap::new(),
            auto_confirm_count: 0,
            clients: HashSet::new(),
            cancel: CancelToken::new(),
            model: None,
            branch: "main".to_string(),
        }
    }
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    by_conversation: HashMap<String, HashSet<String>>,
}

/// Process-wide session registry.
#[derive(Default)]
pub struct SessionManager {
    inner: Mutex<Inner>,
}

impl SessionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a session for a conversation, returning its id.
    pub fn create_session(&self, conversation_id: &str) -> String {
        let session = Session::new(conversation_id);
        let id = session.id.clone();
        let mut inner = self.inner.lock().unwrap();
        inner
            .by_conversation
            .entry(conversation_id.to_string())
            .or_default()
            .insert(id.clone());
        inner.sessions.insert(id.clone(), session);
        id
    }

    pub fn session_exists(&self, session_id: &str) -> bool {
        self.inner.lock().unwrap().sessions.contains_key(session_id)
    }

    /// Runs a closure against a session, refreshing its activity clock.
    pub fn with_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Session) -> T,
    ) -> crate::Result<T> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| crate::Error::SessionNotFound(session_id.to_string()))?;
        session.last_activity = Utc::now();
        Ok(f(session))
    }

    /// Appends an event to every session of a conversation.
    pub fn add_event(&self, conversation_id: &str, event: Event) {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<String> = inner
            .by_conversation
            .get(conversation_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for id in ids {
            if let Some(session) = inner.sessions.get_mut(&id) {
                session.events.push(event.clone());
                session.last_activity = Utc::now();
            }
        }
    }

    /// Events appended since `index`, or `None` when the session is gone.
    pub fn events_since(&self, session_id: &str, index: usize) -> Option<Vec<Event>> {
        let inner = self.inner.lock().unwrap();
        let session = inner.sessions.get(session_id)?;
        Some(session.events.get(index..).unwrap_or_default().to_vec())
    }

    pub fn add_client(&self, session_id: &str, client_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.clients.insert(client_id.to_string());
            session.active = true;
        }
    }

    pub fn remove_client(&self, session_id: &str, client_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.clients.remove(client_id);
            if session.clients.is_empty() {
                session.active = false;
            }
        }
    }

    pub fn remove_session(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.remove(session_id) {
            if let Some(set) = inner.by_conversation.get_mut(&session.conversation_id) {
                set.remove(session_id);
                if set.is_empty() {
                    inner.by_conversation.remove(&session.conversation_id);
                }
            }
        }
    }

    /// Sweeps sessions idle for longer than `max_age` that are not
    /// generating.
    pub fn clean_inactive(&self, max_age: chrono::Duration) {
        let cutoff = Utc::now() - max_age;
        let stale: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner
                .sessions
                .values()
                .filter(|s| s.last_activity < cutoff && !s.generating)
                .map(|s| s.id.clone())
                .collect()
        };
        for id in stale {
            tracing::debug!(session = %id, "removing inactive session");
            self.remove_session(&id);
        }
    }
}
