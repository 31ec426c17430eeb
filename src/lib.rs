//! # toolchat
//!
//! Agentic chat runtime: a large language model drives your workstation by
//! emitting tool blocks inside its replies. The runtime parses those
//! blocks, obtains confirmation, executes them, feeds the result back into
//! the conversation, and repeats until the model has nothing left to run.
//!
//! ## Overview
//!
//! Two frontends share one core:
//!
//! - an interactive CLI loop (`toolchat`) that streams replies to the
//!   terminal and prompts before each tool execution, and
//! - an HTTP/SSE server (`toolchat-server`) that exposes the same loop as
//!   step-wise operations with explicit per-tool confirm, edit, skip, and
//!   interrupt.
//!
//! ## Architecture
//!
//! - **logmanager**: append-only conversation log, one directory per
//!   conversation, JSONL on disk, branches, advisory locking
//! - **codeblock / tooluse**: parsing tool invocations out of free-form
//!   assistant text (markdown fences, XML, native tool calls)
//! - **tools**: the tool registry (build + activate), dispatch, and the
//!   built-in shell/save/append/patch/python tools
//! - **context / reduce**: prompt assembly, file freshening, token
//!   budgeting
//! - **llm**: the provider contract, the OpenAI-compatible adapter with
//!   retry, and a scripted provider for offline use
//! - **chat**: the CLI agent loop with mid-stream tool detection and
//!   cooperative interruption
//! - **server**: the session machine, event fan-out, and the v2 HTTP API
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use toolchat::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = toolchat::tools::init_registry(None);
//!     let model = toolchat::llm::get_model("local/qwen2.5-32b-instruct");
//!     let provider = toolchat::llm::provider_for(&model)?;
//!
//!     let mut manager = LogManager::create(
//!         "/tmp/demo-conversation",
//!         vec![Message::system("You are a helpful assistant.")],
//!     )?;
//!     manager.append(Message::user("List files in the current directory"))?;
//!
//!     let opts = ChatOptions {
//!         model,
//!         stream: true,
//!         tool_format: ToolFormat::Markdown,
//!         workspace: None,
//!     };
//!     toolchat::chat::run_turn(
//!         &mut manager,
//!         provider.as_ref(),
//!         &registry,
//!         &opts,
//!         &toolchat::tools::always_confirm(),
//!         &CancelToken::new(),
//!         &ApproxCounter,
//!         &mut |token| print!("{token}"),
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod chat;
pub mod codeblock;
pub mod context;
pub mod dirs;
mod error;
pub mod interrupt;
pub mod llm;
pub mod logmanager;
pub mod message;
pub mod reduce;
pub mod server;
pub mod tooluse;
pub mod tools;

pub use error::{Error, Result};

/// The most commonly used types and functions.
pub mod prelude {
    pub use crate::chat::ChatOptions;
    pub use crate::codeblock::Codeblock;
    pub use crate::interrupt::{CancelToken, INTERRUPT_MARKER};
    pub use crate::llm::{ModelMeta, Provider};
    pub use crate::logmanager::{Log, LogManager};
    pub use crate::message::{Message, Role};
    pub use crate::reduce::{ApproxCounter, TokenCounter};
    pub use crate::tooluse::{ToolFormat, ToolUse};
    pub use crate::tools::{ToolRegistry, ToolSpec};
    pub use crate::{Error, Result};
}
