//! Patch tool: applies search/replace blocks to existing files.
//!
//! Patch format, one or more hunks per block:
//!
//! ```text
//! <<<<<<< ORIGINAL
//! original lines
//! =======
//! updated lines
//! >>>>>>> UPDATED
//! ```

use super::{ExecuteContext, MessageStream, Parameter, ToolSpec};
use crate::message::Message;
use std::path::PathBuf;

const ORIGINAL: &str = "<<<<<<< ORIGINAL";
const DIVIDER: &str = "=======";
const UPDATED: &str = ">>>>>>> UPDATED";

pub fn tool_spec() -> ToolSpec {
    ToolSpec {
        name: "patch".to_string(),
        desc: "Apply search/replace edits to an existing file".to_string(),
        instructions: format!(
            "Use a `patch` block with the filename as argument. Each hunk \
             contains the original lines between `{ORIGINAL}` and `{DIVIDER}`, \
             and their replacement between `{DIVIDER}` and `{UPDATED}`. The \
             original lines must match the file exactly."
        ),
        examples: format!(
            "```patch hello.py\n{ORIGINAL}\nprint('hello')\n{DIVIDER}\nprint('goodbye')\n{UPDATED}\n```"
        ),
        block_types: vec!["patch".into()],
        parameters: vec![Parameter::required("path", "string", "File to patch")],
        available: true,
        init: None,
        execute: Some(execute_patch),
    }
}

/// One parsed hunk.
struct Hunk {
    original: String,
    updated: String,
}

fn parse_hunks(content: &str) -> crate::Result<Vec<Hunk>> {
    let mut hunks = Vec::new();
    let mut rest = content;

    while let Some(start) = rest.find(ORIGINAL) {
        let after_start = &rest[start + ORIGINAL.len()..];
        let divider = after_start
            .find(DIVIDER)
            .ok_or_else(|| crate::Error::tool_invocation("patch hunk missing divider"))?;
        let end = after_start
            .find(UPDATED)
            .ok_or_else(|| crate::Error::tool_invocation("patch hunk missing end marker"))?;
        if end < divider {
            return Err(crate::Error::tool_invocation("malformed patch hunk"));
        }

        let original = after_start[..divider].trim_matches('\n');
        let updated = after_start[divider + DIVIDER.len()..end].trim_matches('\n');
        hunks.push(Hunk {
            original: original.to_string(),
            updated: updated.to_string(),
        });
        rest = &after_start[end + UPDATED.len()..];
    }

    if hunks.is_empty() {
        return Err(crate::Error::tool_invocation("no patch hunks found"));
    }
    Ok(hunks)
}

fn execute_patch(ctx: ExecuteContext) -> MessageStream {
    Box::pin(async_stream::stream! {
        yield apply_patch(&ctx).await;
    })
}

async fn apply_patch(ctx: &ExecuteContext) -> crate::Result<Message> {
    let path = ctx
        .args
        .first()
        .map(PathBuf::from)
        .ok_or_else(|| crate::Error::tool_invocation("no filename given"))?;
    if !path.exists() {
        return Err(crate::Error::tool_invocation(format!(
            "file does not exist: {}",
            path.display()
        )));
    }

    let hunks = parse_hunks(&ctx.content)?;
    let mut text = tokio::fs::read_to_string(&path).await?;

    for (i, hunk) in hunks.iter().enumerate() {
        if !text.contains(&hunk.original) {
            return Err(crate::Error::tool_execution(format!(
                "hunk {} not found in {}: original lines do not match",
                i + 1,
                path.display()
            )));
        }
        text = text.replacen(&hunk.original, &hunk.updated, 1);
    }

    tokio::fs::write(&path, &text).await?;
    Ok(Message::system(format!(
        "Patched {} ({} hunk{})",
        path.display(),
        hunks.len(),
        if hunks.len() == 1 { "" } else { "s" }
    )))
}
