//! Tool specifications, the registry, and dispatch.
//!
//! A [`ToolSpec`] describes one capability: its prompt documentation, the
//! language tags that route codeblocks to it, and the functions that probe
//! and execute it. Specs are plain data with function pointers and are
//! immutable once registered.
//!
//! The registry is built in two phases: [`ToolRegistry::build`] is a pure
//! function over the discovered specs and an optional allowlist, and
//! [`ToolRegistry::activate`] runs each tool's `init` probe, marking tools
//! whose probe fails as unavailable while keeping them registered (so the
//! system prompt can mention them as such).

mod patch;
mod python;
mod save;
mod shell;

use crate::interrupt::CancelToken;
use crate::message::Message;
use crate::tooluse::ToolUse;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;

pub use patch::tool_spec as patch_tool;
pub use python::tool_spec as python_tool;
pub use save::{append_tool, save_tool};
pub use shell::tool_spec as shell_tool;

/// Stream of messages produced by a tool executor. Each yield is a
/// cooperative checkpoint for cancellation.
pub type MessageStream = Pin<Box<dyn Stream<Item = crate::Result<Message>> + Send>>;

/// Asks the user whether to run a tool. Returns false to abort.
pub type ConfirmFunc = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A ConfirmFunc that always approves.
pub fn always_confirm() -> ConfirmFunc {
    Arc::new(|_| true)
}

/// Everything an executor gets to work with.
pub struct ExecuteContext {
    /// The invocation body (code, file contents, patch, ...).
    pub content: String,
    /// Positional arguments from the block infostring.
    pub args: Vec<String>,
    /// Keyword arguments from native tool calls.
    pub kwargs: Option<serde_json::Map<String, serde_json::Value>>,
    /// Confirmation callback for secondary prompts (e.g. overwrite).
    pub confirm: ConfirmFunc,
}

/// Executor entry point. Plain function pointer so specs stay `Copy`-cheap
/// and trivially immutable.
pub type ExecuteFn = fn(ExecuteContext) -> MessageStream;

/// Capability probe run once at activation.
pub type InitFn = fn() -> crate::Result<()>;

/// One declared tool parameter, used for native tool schemas and prompt
/// documentation.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub type_: String,
    pub description: String,
    pub required: bool,
}

impl Parameter {
    pub fn required(name: &str, type_: &str, description: &str) -> Self {
        Self {
            name: name.into(),
            type_: type_.into(),
            description: description.into(),
            required: true,
        }
    }
}

/// Specification of one tool. Immutable after registration.
#[derive(Clone)]
pub struct ToolSpec {
    /// Unique tool name; also the canonical language tag.
    pub name: String,
    /// One-line description for listings and native schemas.
    pub desc: String,
    /// Usage instructions included in the system prompt.
    pub instructions: String,
    /// Example invocations included in the system prompt.
    pub examples: String,
    /// Language tags that route codeblocks to this tool.
    pub block_types: Vec<String>,
    /// Declared parameters for the native tool-call schema.
    pub parameters: Vec<Parameter>,
    /// Flipped to false when the activation probe fails.
    pub available: bool,
    /// Optional capability probe.
    pub init: Option<InitFn>,
    /// Executor; tools without one are documentation-only.
    pub execute: Option<ExecuteFn>,
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("block_types", &self.block_types)
            .field("available", &self.available)
            .finish()
    }
}

impl ToolSpec {
    /// Whether this tool writes files from filename-tagged blocks.
    pub fn is_file_writer(&self) -> bool {
        self.name == "save" || self.name == "append"
    }

    /// Whether running this tool can modify workspace files.
    pub fn modifies_files(&self) -> bool {
        matches!(self.name.as_str(), "save" | "append" | "patch")
    }
}

/// Tool names whose execution can modify workspace files; used to decide
/// when to run the post-turn checks.
pub fn file_modifying_tools() -> [&'static str; 3] {
    ["save", "patch", "append"]
}

/// Report of one tool's activation probe.
#[derive(Debug, Clone)]
pub struct ActivationReport {
    pub tool: String,
    pub available: bool,
    pub reason: Option<String>,
}

/// Ordered, process-wide set of tools, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolSpec>,
}

impl ToolRegistry {
    /// Builds a registry from discovered specs, restricted by an optional
    /// allowlist. Pure: no probes run, discovery order is preserved.
    pub fn build(discovered: Vec<ToolSpec>, allowlist: Option<&[String]>) -> Self {
        let tools = match allowlist {
            Some(allowed) if !allowed.is_empty() => discovered
                .into_iter()
                .filter(|spec| allowed.iter().any(|name| name == &spec.name))
                .collect(),
            _ => discovered,
        };
        Self { tools }
    }

    /// Runs each tool's `init` probe. Tools whose probe fails become
    /// unavailable but stay registered.
    pub fn activate(&mut self) -> Vec<ActivationReport> {
        let mut reports = Vec::with_capacity(self.tools.len());
        for spec in &mut self.tools {
            let mut reason = None;
            if let Some(init) = spec.init {
                if let Err(err) = init() {
                    tracing::warn!(tool = %spec.name, error = %err, "tool unavailable");
                    spec.available = false;
                    reason = Some(err.to_string());
                }
            }
            reports.push(ActivationReport {
                tool: spec.name.clone(),
                available: spec.available,
                reason,
            });
        }
        reports
    }

    pub fn get_tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|spec| spec.name == name)
    }

    /// Resolves a language tag: a registered block type, or a
    /// filename-style tag routed to the file writer.
    pub fn get_tool_for_langtag(&self, lang: &str) -> Option<&ToolSpec> {
        let tag = lang.split_whitespace().next().unwrap_or_default();
        if tag.is_empty() {
            return None;
        }
        self.tools
            .iter()
            .find(|spec| spec.block_types.iter().any(|bt| bt == tag))
            .or_else(|| {
                crate::codeblock::is_filename(tag)
                    .then(|| self.get_tool("save"))
                    .flatten()
            })
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.get_tool(name).is_some()
    }

    pub fn available_tools(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.iter().filter(|spec| spec.available)
    }

    pub fn all_tools(&self) -> &[ToolSpec] {
        &self.tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Enumerates the built-in tool modules, in the order they are documented
/// in the system prompt.
pub fn discover_tools() -> Vec<ToolSpec> {
    vec![
        shell_tool(),
        save_tool(),
        append_tool(),
        patch_tool(),
        python_tool(),
    ]
}

/// Convenience: discover, restrict, activate, and share.
pub fn init_registry(allowlist: Option<&[String]>) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::build(discover_tools(), allowlist);
    for report in registry.activate() {
        if !report.available {
            tracing::info!(
                tool = %report.tool,
                reason = report.reason.as_deref().unwrap_or("unknown"),
                "registered as unavailable"
            );
        }
    }
    Arc::new(registry)
}

/// Executes a single tool-use, returning the executor's message stream.
///
/// The caller owns the pulls: cancellation is checked between yields via
/// [`execute_msg`] or the session machine, not in here.
pub fn execute_tooluse(
    tooluse: &ToolUse,
    registry: &ToolRegistry,
    confirm: ConfirmFunc,
) -> crate::Result<MessageStream> {
    let spec = registry
        .get_tool(&tooluse.tool)
        .ok_or_else(|| crate::Error::ToolNotFound(tooluse.tool.clone()))?;
    if !spec.available {
        return Err(crate::Error::tool_invocation(format!(
            "tool is not available: {}",
            spec.name
        )));
    }
    let execute = spec.execute.ok_or_else(|| {
        crate::Error::tool_invocation(format!("tool has no executor: {}", spec.name))
    })?;

    Ok(execute(ExecuteContext {
        content: tooluse.content.clone(),
        args: tooluse.args.clone(),
        kwargs: tooluse.kwargs.clone(),
        confirm,
    }))
}

/// Parses and executes every runnable tool-use in an assistant message, in
/// order. Each produced message is yielded as it arrives; a declined
/// confirmation yields an abort notice and stops; cancellation between
/// yields stops with an interrupt marker.
pub fn execute_msg(
    msg: &Message,
    registry: Arc<ToolRegistry>,
    confirm: ConfirmFunc,
    cancel: CancelToken,
) -> MessageStream {
    let tooluses = ToolUse::iter_from_content(&msg.content, &registry);

    Box::pin(async_stream::stream! {
        for tooluse in tooluses {
            if !tooluse.is_runnable(&registry) {
                continue;
            }
            if cancel.is_cancelled() {
                yield Ok(Message::system(crate::interrupt::INTERRUPT_MARKER));
                return;
            }
            if !confirm(&format!("Run {}?", tooluse.tool)) {
                yield Ok(Message::system("Aborted: user declined tool execution"));
                return;
            }

            match execute_tooluse(&tooluse, &registry, confirm.clone()) {
                Ok(mut stream) => {
                    while let Some(result) = stream.next().await {
                        if cancel.is_cancelled() {
                            yield Ok(Message::system(crate::interrupt::INTERRUPT_MARKER));
                            return;
                        }
                        match result {
                            Ok(mut out) => {
                                if out.call_id.is_none() {
                                    out.call_id = tooluse.call_id.clone();
                                }
                                yield Ok(out);
                            }
                            Err(err) => {
                                // Executor failures become visible to the
                                // model so it can correct itself.
                                yield Ok(Message::system(format!("Error: {err}")));
                            }
                        }
                    }
                }
                Err(err) => {
                    yield Ok(Message::system(format!("Error: {err}")));
                }
            }
        }
    })
}

/// System-prompt fragment documenting the registered tools.
pub fn tools_prompt(registry: &ToolRegistry) -> String {
    let mut prompt = String::from("# Tools\n\nYou can use the following tools:\n");
    for spec in registry.all_tools() {
        prompt.push_str(&format!("\n## {}\n\n{}\n", spec.name, spec.desc));
        if !spec.available {
            prompt.push_str("\n(currently unavailable on this system)\n");
            continue;
        }
        if !spec.instructions.is_empty() {
            prompt.push_str(&format!("\n{}\n", spec.instructions));
        }
        if !spec.examples.is_empty() {
            prompt.push_str(&format!("\n### Examples\n\n{}\n", spec.examples));
        }
    }
    prompt
}

/// Registry with all built-in tools, unprobed. Unit-test helper.
#[cfg(test)]
pub(crate) fn test_registry() -> ToolRegistry {
    ToolRegistry::build(discover_tools(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_preserves_discovery_order() {
        let registry = ToolRegistry::build(discover_tools(), None);
        let names: Vec<_> = registry.all_tools().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["shell", "save", "append", "patch", "python"]);
    }

    #[test]
    fn test_build_applies_allowlist() {
        let allow = vec!["shell".to_string(), "save".to_string()];
        let registry = ToolRegistry::build(discover_tools(), Some(&allow));
        assert_eq!(registry.len(), 2);
        assert!(registry.has_tool("shell"));
        assert!(!registry.has_tool("patch"));
    }

    #[test]
    fn test_empty_allowlist_keeps_all() {
        let registry = ToolRegistry::build(discover_tools(), Some(&[]));
        assert_eq!(registry.len(), discover_tools().len());
    }

    #[test]
    fn test_langtag_resolution() {
        let registry = test_registry();
        assert_eq!(registry.get_tool_for_langtag("shell").unwrap().name, "shell");
        assert_eq!(registry.get_tool_for_langtag("bash").unwrap().name, "shell");
        // Filename tags route to the file writer.
        assert_eq!(registry.get_tool_for_langtag("src/x.py").unwrap().name, "save");
        assert!(registry.get_tool_for_langtag("klingon").is_none());
        assert!(registry.get_tool_for_langtag("").is_none());
    }

    #[test]
    fn test_failed_init_keeps_tool_registered() {
        fn failing_init() -> crate::Result<()> {
            Err(crate::Error::config("binary missing"))
        }
        let mut spec = shell_tool();
        spec.init = Some(failing_init);
        let mut registry = ToolRegistry::build(vec![spec], None);
        let reports = registry.activate();

        assert_eq!(reports.len(), 1);
        assert!(!reports[0].available);
        assert!(reports[0].reason.as_deref().unwrap().contains("binary missing"));
        // Still registered, so the prompt can mention it as unavailable.
        assert!(registry.has_tool("shell"));
        assert!(registry.available_tools().next().is_none());
    }

    #[test]
    fn test_tools_prompt_mentions_unavailable() {
        let mut registry = test_registry();
        registry.tools[0].available = false;
        let prompt = tools_prompt(&registry);
        assert!(prompt.contains("## shell"));
        assert!(prompt.contains("currently unavailable"));
    }

    #[tokio::test]
    async fn test_execute_msg_declined() {
        use futures::StreamExt;
        let registry = Arc::new(test_registry());
        let msg = Message::assistant("```shell\nls\n```");
        let deny: ConfirmFunc = Arc::new(|_| false);
        let out: Vec<_> = execute_msg(&msg, registry, deny, CancelToken::new())
            .collect()
            .await;
        assert_eq!(out.len(), 1);
        assert!(out[0].as_ref().unwrap().content.contains("Aborted"));
    }

    #[tokio::test]
    async fn test_execute_msg_cancelled_before_start() {
        use futures::StreamExt;
        let registry = Arc::new(test_registry());
        let msg = Message::assistant("```shell\nls\n```");
        let cancel = CancelToken::new();
        cancel.cancel();
        let out: Vec<_> = execute_msg(&msg, registry, always_confirm(), cancel)
            .collect()
            .await;
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].as_ref().unwrap().content,
            crate::interrupt::INTERRUPT_MARKER
        );
    }

    #[tokio::test]
    async fn test_execute_msg_no_tools() {
        use futures::StreamExt;
        let registry = Arc::new(test_registry());
        let msg = Message::assistant("Just prose, no tools.");
        let out: Vec<_> = execute_msg(&msg, registry, always_confirm(), CancelToken::new())
            .collect()
            .await;
        assert!(out.is_empty());
    }
}
