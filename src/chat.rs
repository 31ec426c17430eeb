//! The agent control loop.
//!
//! One turn: assemble the prompt, stream the reply while watching for a
//! runnable tool-use at each newline, append the assistant message, then
//! confirm and execute each tool in order, feeding outputs back into the
//! log. Generation repeats while the last assistant message still carries
//! runnable tools, then control returns to the user.
//!
//! The loop is cancellable at both suspension points: mid-stream (the
//! partial output is kept and an interrupt marker appended) and between
//! tool-executor yields.

use crate::context::{prepare_messages, run_precommit_checks};
use crate::interrupt::{CancelToken, INTERRUPT_MARKER};
use crate::llm::{ModelMeta, Provider};
use crate::logmanager::{Log, LogManager};
use crate::message::{Message, Role};
use crate::reduce::TokenCounter;
use crate::tooluse::{ToolFormat, ToolUse, ToolUseScanner};
use crate::tools::{ConfirmFunc, ToolRegistry, execute_msg, file_modifying_tools};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;

/// Per-conversation loop configuration.
#[derive(Clone)]
pub struct ChatOptions {
    pub model: ModelMeta,
    pub stream: bool,
    pub tool_format: ToolFormat,
    pub workspace: Option<PathBuf>,
}

/// Whether streaming should pause at tool boundaries
/// (`GPTME_BREAK_ON_TOOLUSE`, default true).
pub fn break_on_tooluse() -> bool {
    std::env::var("GPTME_BREAK_ON_TOOLUSE")
        .map(|v| !["0", "false", "no"].contains(&v.to_lowercase().as_str()))
        .unwrap_or(true)
}

/// Whether the loop should hand control back to the user.
pub fn needs_user_input(log: &Log) -> bool {
    let Some(last) = log.last() else {
        return true;
    };
    last.role == Role::Assistant
        || last.content == INTERRUPT_MARKER
        || last.pinned
        || !log.iter().any(|msg| msg.role == Role::User)
}

/// Whether a file-modifying tool ran in the (up to three) messages since
/// the last user message.
pub fn check_for_modifications(log: &Log, registry: &ToolRegistry) -> bool {
    let since_user: Vec<&Message> = log
        .iter()
        .rev()
        .take_while(|msg| msg.role != Role::User)
        .collect();

    since_user.iter().take(3).any(|msg| {
        ToolUse::iter_from_content(&msg.content, registry)
            .iter()
            .any(|tu| file_modifying_tools().contains(&tu.tool.as_str()))
    })
}

/// Post-turn check hook: when the turn modified files and no tool remains
/// runnable, run the configured checks and surface failures into the log.
/// Returns true when a check message was appended (control should return
/// to the user).
pub fn post_turn_checks(manager: &mut LogManager, registry: &ToolRegistry) -> crate::Result<bool> {
    let last_assistant = manager
        .log()
        .iter()
        .rev()
        .find(|msg| msg.role == Role::Assistant);
    let has_runnable = last_assistant.is_some_and(|msg| {
        ToolUse::iter_from_content(&msg.content, registry)
            .iter()
            .any(|tu| tu.is_runnable(registry))
    });
    if has_runnable || !check_for_modifications(manager.log(), registry) {
        return Ok(false);
    }

    if let Some(report) = run_precommit_checks() {
        manager.append(Message::system(report))?;
        return Ok(true);
    }
    Ok(false)
}

/// Runs one full turn: generate, execute tools, and keep generating while
/// the model keeps asking for runnable tools.
///
/// Streamed chunks are passed to `on_token` for display before any parsing
/// happens.
#[allow(clippy::too_many_arguments)]
pub async fn run_turn(
    manager: &mut LogManager,
    provider: &dyn Provider,
    registry: &Arc<ToolRegistry>,
    opts: &ChatOptions,
    confirm: &ConfirmFunc,
    cancel: &CancelToken,
    counter: &dyn TokenCounter,
    on_token: &mut dyn FnMut(&str),
) -> crate::Result<()> {
    loop {
        let msgs = prepare_messages(
            manager.log().messages(),
            opts.workspace.as_deref(),
            &opts.model,
            counter,
        );
        let tools = (opts.tool_format == ToolFormat::Tool).then(|| registry.as_ref());

        let generation = generate(provider, &msgs, opts, registry, cancel, on_token, tools).await?;
        log_costs(counter, &msgs, &generation.output, &opts.model);

        if generation.interrupted {
            if !generation.output.trim().is_empty() {
                manager.append(Message::assistant(&generation.output).quiet())?;
            }
            manager.append(Message::system(INTERRUPT_MARKER))?;
            return Ok(());
        }

        let assistant_msg = Message::assistant(&generation.output).quiet();
        manager.append(assistant_msg.clone())?;

        // Execute tools, appending every produced message as it arrives.
        let mut produced = false;
        let mut aborted = false;
        let mut outputs = execute_msg(
            &assistant_msg,
            registry.clone(),
            confirm.clone(),
            cancel.clone(),
        );
        while let Some(result) = outputs.next().await {
            let msg = result?;
            let is_interrupt = msg.content == INTERRUPT_MARKER;
            aborted |= msg.content.starts_with("Aborted");
            manager.append(msg)?;
            produced = true;
            if is_interrupt {
                return Ok(());
            }
        }

        // Generate again only when tool output arrived for a runnable
        // tool-use; otherwise the turn is over.
        let had_runnable = ToolUse::iter_from_content(&assistant_msg.content, registry)
            .iter()
            .any(|tu| tu.is_runnable(registry));
        if !produced || aborted || !had_runnable {
            return Ok(());
        }
    }
}

struct Generation {
    output: String,
    interrupted: bool,
}

async fn generate(
    provider: &dyn Provider,
    msgs: &[Message],
    opts: &ChatOptions,
    registry: &Arc<ToolRegistry>,
    cancel: &CancelToken,
    on_token: &mut dyn FnMut(&str),
    tools: Option<&ToolRegistry>,
) -> crate::Result<Generation> {
    let mut output = String::new();

    if opts.stream && opts.model.supports_streaming {
        let mut stream = provider.stream(msgs, &opts.model, tools).await?;
        let mut scanner = ToolUseScanner::new();
        let break_on_tool = break_on_tooluse();
        // The cancellation flag has no waker, so pulls run under a short
        // deadline and the flag is rechecked on expiry.
        let poll_interval = std::time::Duration::from_millis(50);

        loop {
            if cancel.is_cancelled() {
                return Ok(Generation {
                    output,
                    interrupted: true,
                });
            }
            let chunk = match tokio::time::timeout(poll_interval, stream.next()).await {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };
            on_token(&chunk);
            output.push_str(&chunk);

            // Stop consuming tokens as soon as a runnable tool completes.
            if break_on_tool && scanner.push(&chunk, registry).is_some() {
                break;
            }
        }
    } else {
        output = provider.chat(msgs, &opts.model, tools).await?;
        if cancel.is_cancelled() {
            return Ok(Generation {
                output,
                interrupted: true,
            });
        }
        on_token(&output);
    }

    Ok(Generation {
        output,
        interrupted: false,
    })
}

/// Per-turn token accounting, when `GPTME_COSTS` is enabled.
fn log_costs(counter: &dyn TokenCounter, msgs: &[Message], output: &str, model: &ModelMeta) {
    let enabled = std::env::var("GPTME_COSTS")
        .map(|v| ["1", "true", "yes"].contains(&v.to_lowercase().as_str()))
        .unwrap_or(false);
    if !enabled {
        return;
    }
    let tokens_in = counter.estimate(msgs, &model.model);
    let tokens_out = counter.estimate(&[Message::assistant(output)], &model.model);
    tracing::info!(model = %model.full(), tokens_in, tokens_out, "turn token usage");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ScriptStep, ScriptedProvider};
    use crate::reduce::ApproxCounter;
    use crate::tools::always_confirm;

    fn options() -> ChatOptions {
        ChatOptions {
            model: ModelMeta::new("local", "scripted", 32_768),
            stream: true,
            tool_format: ToolFormat::Markdown,
            workspace: None,
        }
    }

    fn new_manager(dir: &tempfile::TempDir) -> LogManager {
        LogManager::create(
            dir.path().join("conv"),
            vec![Message::system("You are a helpful assistant.")],
        )
        .unwrap()
    }

    fn registry() -> Arc<ToolRegistry> {
        Arc::new(ToolRegistry::build(crate::tools::discover_tools(), None))
    }

    #[test]
    fn test_needs_user_input() {
        let mut log = Log::default();
        assert!(needs_user_input(&log));

        log = Log::new(vec![Message::system("s")]);
        // No user message yet.
        assert!(needs_user_input(&log));

        log = Log::new(vec![Message::system("s"), Message::user("hi")]);
        assert!(!needs_user_input(&log));

        log = Log::new(vec![Message::user("hi"), Message::assistant("hello")]);
        assert!(needs_user_input(&log));

        log = Log::new(vec![
            Message::user("hi"),
            Message::system(INTERRUPT_MARKER),
        ]);
        assert!(needs_user_input(&log));
    }

    #[test]
    fn test_check_for_modifications() {
        let registry = registry();
        let log = Log::new(vec![
            Message::user("write a file"),
            Message::assistant("```save out.txt\nhello\n```"),
            Message::system("Saved to out.txt"),
        ]);
        assert!(check_for_modifications(&log, &registry));

        let log = Log::new(vec![
            Message::user("list files"),
            Message::assistant("```shell\nls\n```"),
            Message::system("Ran command"),
        ]);
        assert!(!check_for_modifications(&log, &registry));

        // Modifications before the last user message do not count.
        let log = Log::new(vec![
            Message::assistant("```save out.txt\nhello\n```"),
            Message::user("now something else"),
        ]);
        assert!(!check_for_modifications(&log, &registry));
    }

    #[tokio::test]
    async fn test_turn_without_tools() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = new_manager(&dir);
        manager.append(Message::user("hello")).unwrap();

        let provider = ScriptedProvider::replying("Hi there! How can I help?");
        let mut tokens = String::new();
        run_turn(
            &mut manager,
            &provider,
            &registry(),
            &options(),
            &always_confirm(),
            &CancelToken::new(),
            &ApproxCounter,
            &mut |t| tokens.push_str(t),
        )
        .await
        .unwrap();

        assert_eq!(manager.log().len(), 3);
        assert_eq!(manager.log().last().unwrap().role, Role::Assistant);
        assert!(tokens.contains("How can I help?"));
    }

    #[tokio::test]
    async fn test_turn_with_shell_tool() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = new_manager(&dir);
        manager.append(Message::user("say hi via shell")).unwrap();

        let provider = ScriptedProvider::new([
            ScriptStep::Reply("Running:\n\n```shell\necho turn-test\n```\n".into()),
            ScriptStep::Reply("Done: it printed turn-test.".into()),
        ]);
        run_turn(
            &mut manager,
            &provider,
            &registry(),
            &options(),
            &always_confirm(),
            &CancelToken::new(),
            &ApproxCounter,
            &mut |_| {},
        )
        .await
        .unwrap();

        // system, user, assistant(tool), tool output, assistant(final)
        let msgs = manager.log().messages();
        assert_eq!(msgs.len(), 5);
        assert!(msgs[3].content.contains("turn-test"));
        assert_eq!(msgs[4].role, Role::Assistant);
        assert!(msgs[4].content.contains("Done"));
    }

    #[tokio::test]
    async fn test_turn_stops_when_declined() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = new_manager(&dir);
        manager.append(Message::user("run something")).unwrap();

        let provider = ScriptedProvider::replying("```shell\nrm -rf /\n```\n");
        let deny: ConfirmFunc = Arc::new(|_| false);
        run_turn(
            &mut manager,
            &provider,
            &registry(),
            &options(),
            &deny,
            &CancelToken::new(),
            &ApproxCounter,
            &mut |_| {},
        )
        .await
        .unwrap();

        let msgs = manager.log().messages();
        assert!(msgs.last().unwrap().content.contains("Aborted"));
    }

    #[tokio::test]
    async fn test_interrupt_during_stream() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = new_manager(&dir);
        manager.append(Message::user("tell me a story")).unwrap();

        let provider = ScriptedProvider::new([ScriptStep::HangAfter(vec![
            "Once ".into(),
            "upon ".into(),
            "a ".into(),
            "time".into(),
        ])]);
        let cancel = CancelToken::new();
        let cancel_clone = cancel.clone();

        // Cancel once the first tokens have been seen.
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen_clone = seen.clone();
        tokio::spawn(async move {
            while seen_clone.load(std::sync::atomic::Ordering::SeqCst) < 4 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            cancel_clone.cancel();
        });

        run_turn(
            &mut manager,
            &provider,
            &registry(),
            &options(),
            &always_confirm(),
            &cancel,
            &ApproxCounter,
            &mut |_| {
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            },
        )
        .await
        .unwrap();

        let msgs = manager.log().messages();
        assert_eq!(msgs.last().unwrap().content, INTERRUPT_MARKER);
        let partial = &msgs[msgs.len() - 2];
        assert_eq!(partial.role, Role::Assistant);
        assert_eq!(partial.content, "Once upon a time");
    }
}
