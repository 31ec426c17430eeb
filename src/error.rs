//! Error types for the toolchat runtime

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the runtime
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error (LLM provider)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error while reading or writing conversation state
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// A line of a conversation file could not be parsed.
    ///
    /// Loads fail loudly instead of truncating; the line number points at
    /// the offending entry.
    #[error("malformed conversation entry at line {line}: {source}")]
    LogParse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Conversation directory already exists
    #[error("conversation already exists: {0}")]
    ConversationExists(String),

    /// Conversation directory not found
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    /// Session id not known to the session manager
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Pending tool id not known to the session
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// A tool-use parsed into an invalid invocation
    #[error("tool invocation error: {0}")]
    ToolInvocation(String),

    /// A tool executor failed mid-run
    #[error("tool execution error: {0}")]
    ToolExecution(String),

    /// Transient LLM failure (overload, 5xx); retried before surfacing
    #[error("LLM transient error: {0}")]
    LlmTransient(String),

    /// Permanent LLM failure (auth, malformed request); never retried
    #[error("LLM error: {0}")]
    LlmPermanent(String),

    /// User cancellation; not a failure, but propagates like one
    #[error("interrupted")]
    Interrupted,

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Invalid input
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new tool invocation error
    pub fn tool_invocation(msg: impl Into<String>) -> Self {
        Error::ToolInvocation(msg.into())
    }

    /// Create a new tool execution error
    pub fn tool_execution(msg: impl Into<String>) -> Self {
        Error::ToolExecution(msg.into())
    }

    /// Create a new transient LLM error
    pub fn llm_transient(msg: impl Into<String>) -> Self {
        Error::LlmTransient(msg.into())
    }

    /// Create a new permanent LLM error
    pub fn llm_permanent(msg: impl Into<String>) -> Self {
        Error::LlmPermanent(msg.into())
    }

    /// True for errors worth retrying with backoff.
    ///
    /// Network-level failures and explicit transient provider errors
    /// qualify; everything else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Http(_) | Error::LlmTransient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_config() {
        let err = Error::config("no model selected");
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.to_string(), "invalid configuration: no model selected");
    }

    #[test]
    fn test_error_log_parse_line_number() {
        let source = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err = Error::LogParse { line: 3, source };
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn test_error_transient_classification() {
        assert!(Error::llm_transient("overloaded").is_transient());
        assert!(!Error::llm_permanent("bad api key").is_transient());
        assert!(!Error::config("x").is_transient());
        assert!(!Error::Interrupted.is_transient());
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Storage(_)));
    }
}
