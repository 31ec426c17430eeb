//! Prompt assembly: turning a conversation log into the message list that
//! is actually sent to the model.
//!
//! The pipeline is enrich → reduce → limit:
//!
//! 1. attached file contents are inlined as fenced codeblocks (with a
//!    marker instead when the file changed after the message was written),
//! 2. in fresh-context mode a synthesised system message with the current
//!    workspace state is inserted just before the latest user message,
//! 3. the log is reduced and limited to the model's context window.
//!
//! The fresh-context message is built per assembly and never appended to
//! the log, so running two steps back-to-back cannot duplicate it.

use crate::llm::ModelMeta;
use crate::message::{Message, Role};
use crate::reduce::{TokenCounter, limit_log, reduce_log};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Marker inlined instead of stale file contents.
pub const FILE_MODIFIED_MARKER: &str = "<file was modified after message>";

/// Whether fresh-context mode is enabled (`GPTME_FRESH`).
pub fn use_fresh_context() -> bool {
    env_truthy("GPTME_FRESH")
}

/// Whether pre-commit checks are enabled: `GPTME_CHECK` explicitly, or
/// inferred from a `.pre-commit-config.yaml` in the current directory or
/// any ancestor. An explicit false always wins.
pub fn use_checks() -> bool {
    match std::env::var("GPTME_CHECK").ok().as_deref() {
        Some(v) if ["0", "false", "no"].contains(&v.to_lowercase().as_str()) => return false,
        Some(v) if ["1", "true", "yes"].contains(&v.to_lowercase().as_str()) => return true,
        _ => {}
    }
    let cwd = std::env::current_dir().unwrap_or_default();
    cwd.ancestors()
        .any(|dir| dir.join(".pre-commit-config.yaml").exists())
}

fn env_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| ["1", "true", "yes"].contains(&v.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// How to render a path: relative to the current directory for workspace
/// files, absolute otherwise.
pub fn file_to_display_path(file: &Path, workspace: Option<&Path>) -> PathBuf {
    let resolved = file
        .canonicalize()
        .unwrap_or_else(|_| file.to_path_buf());
    if let Some(workspace) = workspace {
        if let Ok(cwd) = std::env::current_dir() {
            if resolved.starts_with(workspace) {
                if let Ok(relative) = resolved.strip_prefix(&cwd) {
                    return relative.to_path_buf();
                }
            }
        }
    }
    resolved
}

fn md_codeblock(tag: impl std::fmt::Display, content: &str) -> String {
    format!("```{tag}\n{content}\n```")
}

/// Inlines attached file contents into a message as fenced codeblocks.
///
/// With `check_modified`, files changed after the message's timestamp get
/// [`FILE_MODIFIED_MARKER`] instead of their (now stale) contents.
pub fn append_file_content(
    msg: &Message,
    workspace: Option<&Path>,
    check_modified: bool,
) -> Message {
    if msg.files.is_empty() {
        return msg.clone();
    }

    let mut sections = Vec::new();
    for file in &msg.files {
        let display = file_to_display_path(file, workspace);
        let modified_after = check_modified
            && std::fs::metadata(file)
                .and_then(|meta| meta.modified())
                .map(|mtime| chrono::DateTime::<chrono::Utc>::from(mtime) > msg.timestamp)
                .unwrap_or(false);

        if modified_after {
            sections.push(md_codeblock(display.display(), FILE_MODIFIED_MARKER));
        } else if let Ok(content) = std::fs::read_to_string(file) {
            sections.push(md_codeblock(display.display(), content.trim_end()));
        }
        // Unreadable/binary files are skipped.
    }

    if sections.is_empty() {
        return msg.clone();
    }
    msg.replace_content(format!("{}\n\n{}", msg.content, sections.join("\n\n")))
}

/// `git status -vv` output as a codeblock, when inside a repository.
pub fn git_status() -> Option<String> {
    let output = Command::new("git").args(["status", "-vv"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(md_codeblock(
        "git status -vv",
        String::from_utf8_lossy(&output.stdout).trim_end(),
    ))
}

/// Files referenced by messages, ranked by `(mention_count, mtime)`
/// descending.
pub fn get_mentioned_files(msgs: &[Message], workspace: Option<&Path>) -> Vec<PathBuf> {
    let mut counts: HashMap<PathBuf, usize> = HashMap::new();
    for msg in msgs {
        for file in &msg.files {
            let resolved = if file.is_absolute() {
                file.clone()
            } else if let Some(workspace) = workspace {
                workspace.join(file)
            } else {
                file.clone()
            };
            *counts.entry(resolved).or_default() += 1;
        }
    }

    let mut files: Vec<(PathBuf, usize)> = counts.into_iter().collect();
    files.sort_by_key(|(path, count)| {
        let mtime = std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp())
            .unwrap_or(0);
        std::cmp::Reverse((*count, mtime))
    });
    files.into_iter().map(|(path, _)| path).collect()
}

/// Runs pre-commit on the workspace; returns its output when checks fail,
/// `None` when clean or disabled.
pub fn run_precommit_checks() -> Option<String> {
    if !use_checks() {
        return None;
    }

    let output = Command::new("pre-commit")
        .args(["run", "--all-files"])
        .output()
        .ok()?;
    if output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut report = String::from("Pre-commit checks failed\n");
    if !stdout.trim().is_empty() {
        report.push_str(&format!("\n{}\n", md_codeblock("stdout", stdout.trim_end())));
    }
    if !stderr.trim().is_empty() {
        report.push_str(&format!("\n{}\n", md_codeblock("stderr", stderr.trim_end())));
    }
    Some(report.trim_end().to_string())
}

/// Synthesises the fresh-context system message: working directory, git
/// status, failing checks, and the contents of the ten most relevant files.
pub fn gather_fresh_context(msgs: &[Message], workspace: Option<&Path>) -> Message {
    let mut sections = Vec::new();

    if let Some(checks) = run_precommit_checks() {
        sections.push(checks);
    }
    if let Some(status) = git_status() {
        sections.push(status);
    }

    for file in get_mentioned_files(msgs, workspace).into_iter().take(10) {
        if !file.exists() {
            continue;
        }
        let display = file_to_display_path(&file, workspace);
        match std::fs::read_to_string(&file) {
            Ok(content) => sections.push(md_codeblock(display.display(), content.trim_end())),
            Err(_) => sections.push(md_codeblock(display.display(), "<binary file>")),
        }
    }

    let cwd = std::env::current_dir().unwrap_or_default();
    Message::system(format!(
        "# Context\n\
         Working directory: {}\n\n\
         This context message is inserted before the last user message.\n\
         It contains the current state of relevant files and git status at \
         the time of processing.\n\
         The file contents shown here are the source of truth; file contents \
         shown elsewhere in the conversation may be outdated.\n\n{}",
        cwd.display(),
        sections.join("\n\n")
    ))
}

/// Enriches messages with file contents and, in fresh-context mode, the
/// synthesised context message.
pub fn enrich_messages_with_context(msgs: &[Message], workspace: Option<&Path>) -> Vec<Message> {
    let fresh = use_fresh_context();
    let mut enriched: Vec<Message> = msgs
        .iter()
        .map(|msg| append_file_content(msg, workspace, fresh))
        .collect();

    if fresh {
        let context_msg = gather_fresh_context(&enriched, workspace);
        let insert_at = enriched
            .iter()
            .rposition(|msg| msg.role == Role::User)
            .unwrap_or(enriched.len());
        enriched.insert(insert_at, context_msg);
    }

    enriched
}

/// Full assembly pipeline: enrich, reduce to 90% of the window, then hard
/// limit.
pub fn prepare_messages(
    msgs: &[Message],
    workspace: Option<&Path>,
    model: &ModelMeta,
    counter: &dyn TokenCounter,
) -> Vec<Message> {
    let enriched = enrich_messages_with_context(msgs, workspace);
    let soft_limit = (model.context as f64 * 0.9) as usize;
    let reduced = reduce_log(&enriched, soft_limit, counter, &model.model);
    limit_log(&reduced, model.context, counter, &model.model)
}
