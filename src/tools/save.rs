//! File writer tools: `save` (create/overwrite) and `append`.
//!
//! Blocks tagged with a filename (`` ```hello.py ``) route here with the
//! tag preserved as the path argument.

use super::{ExecuteContext, MessageStream, Parameter, ToolSpec};
use crate::message::Message;
use std::path::{Path, PathBuf};

pub fn save_tool() -> ToolSpec {
    ToolSpec {
        name: "save".to_string(),
        desc: "Write the block contents to a file".to_string(),
        instructions: "Tag a codeblock with the target filename to save it. \
                       Parent directories are created as needed."
            .to_string(),
        examples: "```hello.py\nprint('hello')\n```".to_string(),
        block_types: vec!["save".into()],
        parameters: vec![Parameter::required("path", "string", "Target file path")],
        available: true,
        init: None,
        execute: Some(execute_save),
    }
}

pub fn append_tool() -> ToolSpec {
    ToolSpec {
        name: "append".to_string(),
        desc: "Append the block contents to a file".to_string(),
        instructions: "Use an `append` block with the filename as argument to \
                       add to the end of an existing file."
            .to_string(),
        examples: "```append hello.py\nprint('again')\n```".to_string(),
        block_types: vec!["append".into()],
        parameters: vec![Parameter::required("path", "string", "Target file path")],
        available: true,
        init: None,
        execute: Some(execute_append),
    }
}

fn target_path(ctx: &ExecuteContext) -> crate::Result<PathBuf> {
    if let Some(arg) = ctx.args.first() {
        return Ok(PathBuf::from(arg));
    }
    // Native calls pass the path as a kwarg.
    ctx.kwargs
        .as_ref()
        .and_then(|kwargs| kwargs.get("path"))
        .and_then(|value| value.as_str())
        .map(PathBuf::from)
        .ok_or_else(|| crate::Error::tool_invocation("no filename given"))
}

fn ensure_parent(path: &Path) -> crate::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn execute_save(ctx: ExecuteContext) -> MessageStream {
    Box::pin(async_stream::stream! {
        yield save(&ctx).await;
    })
}

async fn save(ctx: &ExecuteContext) -> crate::Result<Message> {
    let path = target_path(ctx)?;
    let code = ctx.content.trim_start_matches('\n');

    if path.exists() && !(ctx.confirm)(&format!("Overwrite {}?", path.display())) {
        return Ok(Message::system("Save cancelled."));
    }

    ensure_parent(&path)?;
    tokio::fs::write(&path, code).await?;
    Ok(Message::system(format!("Saved to {}", path.display())))
}

fn execute_append(ctx: ExecuteContext) -> MessageStream {
    Box::pin(async_stream::stream! {
        yield append(&ctx).await;
    })
}

async fn append(ctx: &ExecuteContext) -> crate::Result<Message> {
    let path = target_path(ctx)?;
    if !path.exists() {
        return Err(crate::Error::tool_invocation(format!(
            "file does not exist: {}",
            path.display()
        )));
    }

    let mut code = ctx.content.trim_start_matches('\n').to_string();
    if !code.ends_with('\n') {
        code.push('\n');
    }
    let mut existing = tokio::fs::read_to_string(&path).await?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        existing.push('\n');
    }
    existing.push_str(&code);
    tokio::fs::write(&path, existing).await?;
    Ok(Message::system(format!("Appended to {}", path.display())))
}
