//! Shell tool: runs commands in a bash subprocess.

use super::{ExecuteContext, MessageStream, ToolSpec};
use crate::message::Message;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;

pub fn tool_spec() -> ToolSpec {
    ToolSpec {
        name: "shell".to_string(),
        desc: "Execute shell commands".to_string(),
        instructions: "Run commands by emitting a `shell` codeblock. \
                       stdout, stderr and the exit code are returned."
            .to_string(),
        examples: "```shell\nls -la\n```".to_string(),
        block_types: vec!["shell".into(), "bash".into(), "sh".into()],
        parameters: vec![super::Parameter::required(
            "code",
            "string",
            "The shell command(s) to run",
        )],
        available: true,
        init: Some(probe_bash),
        execute: Some(execute_shell),
    }
}

fn probe_bash() -> crate::Result<()> {
    if std::process::Command::new("bash")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
    {
        Ok(())
    } else {
        Err(crate::Error::config("bash not found on PATH"))
    }
}

fn execute_shell(ctx: ExecuteContext) -> MessageStream {
    Box::pin(async_stream::stream! {
        yield run_command(&ctx.content).await;
    })
}

async fn run_command(command: &str) -> crate::Result<Message> {
    let mut child = tokio::process::Command::new("bash")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| crate::Error::tool_execution(format!("failed to spawn bash: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(command.as_bytes())
            .await
            .map_err(|e| crate::Error::tool_execution(format!("failed to write command: {e}")))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| crate::Error::tool_execution(format!("bash did not exit: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let code = output.status.code().unwrap_or(-1);

    let mut content = format!("Ran command:\n```bash\n{}\n```\n", command.trim());
    if !stdout.trim().is_empty() {
        content.push_str(&format!("\nstdout:\n```\n{}\n```\n", stdout.trim_end()));
    }
    if !stderr.trim().is_empty() {
        content.push_str(&format!("\nstderr:\n```\n{}\n```\n", stderr.trim_end()));
    }
    if code != 0 {
        content.push_str(&format!("\nReturn code: {code}\n"));
    }

    Ok(Message::system(content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::always_confirm;
    use futures::StreamExt;

    fn ctx(content: &str) -> ExecuteContext {
        ExecuteContext {
            content: content.to_string(),
            args: Vec::new(),
            kwargs: None,
            confirm: always_confirm(),
        }
    }

    #[tokio::test]
    async fn test_shell_captures_stdout() {
        let out: Vec<_> = execute_shell(ctx("echo hello")).collect().await;
        assert_eq!(out.len(), 1);
        let msg = out[0].as_ref().unwrap();
        assert!(msg.content.contains("hello"));
        assert!(msg.content.contains("Ran command"));
    }

    #[tokio::test]
    async fn test_shell_reports_exit_code() {
        let out: Vec<_> = execute_shell(ctx("exit 3")).collect().await;
        let msg = out[0].as_ref().unwrap();
        assert!(msg.content.contains("Return code: 3"));
    }

    #[tokio::test]
    async fn test_shell_captures_stderr() {
        let out: Vec<_> = execute_shell(ctx("echo oops >&2")).collect().await;
        let msg = out[0].as_ref().unwrap();
        assert!(msg.content.contains("stderr"));
        assert!(msg.content.contains("oops"));
    }
}
