//! Interactive chat CLI.

use anyhow::Context;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use toolchat::chat::{ChatOptions, needs_user_input, post_turn_checks, run_turn};
use toolchat::interrupt::CancelToken;
use toolchat::llm::{default_model, get_model, provider_for};
use toolchat::logmanager::{LoadOptions, LogManager, list_conversations};
use toolchat::message::{Message, Role};
use toolchat::reduce::ApproxCounter;
use toolchat::tooluse::ToolFormat;
use toolchat::tools::{ConfirmFunc, init_registry, tools_prompt};

/// Chat with an LLM that can run tools on your machine.
#[derive(Debug, Parser)]
#[command(name = "toolchat", version, about)]
struct Cli {
    /// Prompts to send; chain several with a literal `-` between them.
    prompts: Vec<String>,

    /// Conversation name, or "random" for a generated one.
    #[arg(long, default_value = "random")]
    name: String,

    /// Model id (`provider/model`).
    #[arg(long, env = "MODEL")]
    model: Option<String>,

    /// Workspace directory, or `@log` to reuse the conversation's.
    #[arg(long)]
    workspace: Option<String>,

    /// Resume the most recent conversation.
    #[arg(long)]
    resume: bool,

    /// Execute tools without asking.
    #[arg(long)]
    no_confirm: bool,

    /// Exit after processing the given prompts.
    #[arg(long)]
    non_interactive: bool,

    /// System prompt: `full`, `short`, or custom text.
    #[arg(long, default_value = "full")]
    system: String,

    /// Comma-separated tool allowlist.
    #[arg(long, env = "TOOL_ALLOWLIST")]
    tools: Option<String>,

    /// Tool invocation syntax.
    #[arg(long, env = "TOOL_FORMAT", default_value = "markdown")]
    tool_format: String,

    /// Disable streaming output.
    #[arg(long)]
    no_stream: bool,

    /// Show hidden system messages.
    #[arg(long)]
    show_hidden: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let allowlist: Option<Vec<String>> = cli.tools.as_ref().map(|csv| {
        csv.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    });
    let registry = init_registry(allowlist.as_deref());

    let model_id = cli
        .model
        .clone()
        .or_else(default_model)
        .context("no model configured; pass --model or set MODEL")?;
    let model = get_model(&model_id);
    let provider = provider_for(&model)?;
    let tool_format: ToolFormat = cli.tool_format.parse()?;

    let system_prompt = match cli.system.as_str() {
        "full" => format!(
            "You are toolchat, an AI assistant that can use tools on the user's machine.\n\n{}",
            tools_prompt(&registry)
        ),
        "short" => "You are toolchat, an AI assistant that can use tools on the user's machine."
            .to_string(),
        custom => custom.to_string(),
    };

    let logs_home = toolchat::dirs::logs_home();
    let mut manager = if cli.resume {
        let latest = list_conversations(&logs_home, 1)?
            .into_iter()
            .next()
            .context("no conversation to resume")?;
        println!("Resuming {}", latest.id);
        LogManager::load(latest.path, LoadOptions::default())?
    } else {
        let name = if cli.name == "random" {
            toolchat::dirs::random_name()
        } else {
            cli.name.clone()
        };
        let logdir = logs_home.join(toolchat::dirs::conversation_dir_name(&name));
        println!("Starting conversation at {}", logdir.display());
        LogManager::create(logdir, vec![Message::system(system_prompt).hidden()])?
    };

    let workspace: Option<PathBuf> = match cli.workspace.as_deref() {
        Some("@log") => Some(manager.workspace()),
        Some(path) => Some(PathBuf::from(path)),
        None => std::env::current_dir().ok(),
    };
    if let Some(ws) = &workspace {
        let _ = manager.set_workspace(ws);
    }

    let cancel = CancelToken::new();
    spawn_interrupt_handler(cancel.clone());

    let confirm = make_confirm(cli.no_confirm);
    let opts = ChatOptions {
        model,
        stream: !cli.no_stream,
        tool_format,
        workspace,
    };

    print_log(&manager, cli.show_hidden);

    // Positional prompts first, chained on `-`.
    for prompt in split_prompts(&cli.prompts) {
        cancel.reset();
        process_prompt(&mut manager, &prompt, &provider, &registry, &opts, &confirm, &cancel)
            .await?;
    }

    if cli.non_interactive {
        return Ok(());
    }

    // Interactive loop. A completed turn, an appended check failure, or an
    // interrupt marker hands control back to the user; a resumed
    // conversation with an unanswered user message generates first.
    let mut force_input = false;
    loop {
        if !force_input && !needs_user_input(manager.log()) {
            cancel.reset();
            force_input =
                run_loop_once(&mut manager, &provider, &registry, &opts, &confirm, &cancel).await?;
            continue;
        }
        let Some(line) = read_prompt()? else {
            println!("\nGoodbye!");
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        cancel.reset();
        process_prompt(&mut manager, &line, &provider, &registry, &opts, &confirm, &cancel)
            .await?;
        force_input = false;
    }
}

async fn process_prompt(
    manager: &mut LogManager,
    prompt: &str,
    provider: &Arc<dyn toolchat::llm::Provider>,
    registry: &Arc<toolchat::tools::ToolRegistry>,
    opts: &ChatOptions,
    confirm: &ConfirmFunc,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    manager.append(Message::user(prompt).quiet())?;
    run_loop_once(manager, provider, registry, opts, confirm, cancel).await?;
    Ok(())
}

/// Runs one turn and the post-turn checks. Returns true when a check
/// failure was appended, in which case control goes back to the user.
async fn run_loop_once(
    manager: &mut LogManager,
    provider: &Arc<dyn toolchat::llm::Provider>,
    registry: &Arc<toolchat::tools::ToolRegistry>,
    opts: &ChatOptions,
    confirm: &ConfirmFunc,
    cancel: &CancelToken,
) -> anyhow::Result<bool> {
    let before = manager.log().len();
    run_turn(
        manager,
        provider.as_ref(),
        registry,
        opts,
        confirm,
        cancel,
        &ApproxCounter,
        &mut |token| {
            print!("{token}");
            let _ = std::io::stdout().flush();
        },
    )
    .await?;
    println!();

    // Streamed assistant text was already printed; show everything else.
    for msg in manager.log().messages().iter().skip(before) {
        if !msg.quiet && msg.role != Role::Assistant {
            print_message(msg, false);
        }
    }

    let checks_fired = post_turn_checks(manager, registry)?;
    if checks_fired {
        if let Some(last) = manager.log().last() {
            print_message(last, false);
        }
    }
    Ok(checks_fired)
}

fn split_prompts(args: &[String]) -> Vec<String> {
    let mut prompts = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for arg in args {
        if arg == "-" {
            if !current.is_empty() {
                prompts.push(current.join(" "));
                current.clear();
            }
        } else {
            current.push(arg);
        }
    }
    if !current.is_empty() {
        prompts.push(current.join(" "));
    }
    prompts
}

fn make_confirm(no_confirm: bool) -> ConfirmFunc {
    if no_confirm {
        toolchat::tools::always_confirm()
    } else {
        Arc::new(|prompt: &str| {
            print!("{prompt} [Y/n] ");
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() {
                return false;
            }
            let answer = line.trim().to_lowercase();
            answer.is_empty() || answer == "y" || answer == "yes"
        })
    }
}

fn read_prompt() -> anyhow::Result<Option<String>> {
    print!("User: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    let read = std::io::stdin().read_line(&mut line)?;
    if read == 0 {
        return Ok(None); // EOF
    }
    Ok(Some(line.trim_end().to_string()))
}

fn print_log(manager: &LogManager, show_hidden: bool) {
    let mut skipped = 0;
    for msg in manager.log().iter() {
        if msg.hide && !show_hidden {
            skipped += 1;
            continue;
        }
        print_message(msg, true);
    }
    if skipped > 0 {
        println!("(skipped {skipped} hidden system messages, show with --show-hidden)");
    }
    if manager.log().len() > 1 {
        println!("--- ^^^ past messages ^^^ ---");
    }
}

fn print_message(msg: &Message, oneline: bool) {
    let prefix = match msg.role {
        Role::System => "System",
        Role::User => "User",
        Role::Assistant => "Assistant",
        Role::Tool => "Tool",
    };
    if oneline {
        let flat = msg.content.replace('\n', "\\n");
        let shown: String = flat.chars().take(120).collect();
        let ellipsis = if flat.chars().count() > 120 { "..." } else { "" };
        println!("{prefix}: {shown}{ellipsis}");
    } else {
        println!("{prefix}: {}", msg.content);
    }
}

/// First Ctrl-C interrupts the current work; a second within two seconds
/// exits with code 130.
fn spawn_interrupt_handler(cancel: CancelToken) {
    let last = Arc::new(AtomicU64::new(0));
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let now_ms = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            let previous = last.swap(now_ms, Ordering::SeqCst);
            if now_ms.saturating_sub(previous) < 2_000 {
                std::process::exit(130);
            }
            eprintln!("\nInterrupted. Press Ctrl-C again to exit.");
            cancel.cancel();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_prompts_chained() {
        let args: Vec<String> = ["first", "prompt", "-", "second"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(split_prompts(&args), vec!["first prompt", "second"]);
    }

    #[test]
    fn test_split_prompts_empty() {
        assert!(split_prompts(&[]).is_empty());
        assert!(split_prompts(&["-".to_string()]).is_empty());
    }
}
