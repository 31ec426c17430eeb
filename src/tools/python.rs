//! Python tool: runs code through the system interpreter.
//!
//! Availability is probed at activation; on machines without `python3` the
//! tool stays registered but unavailable.

use super::{ExecuteContext, MessageStream, Parameter, ToolSpec};
use crate::message::Message;
use std::process::Stdio;

pub fn tool_spec() -> ToolSpec {
    ToolSpec {
        name: "python".to_string(),
        desc: "Execute Python code".to_string(),
        instructions: "Run Python by emitting a `python` codeblock. The code \
                       is executed with the system python3 interpreter."
            .to_string(),
        examples: "```python\nprint(1 + 2)\n```".to_string(),
        block_types: vec!["python".into(), "py".into(), "ipython".into()],
        parameters: vec![Parameter::required("code", "string", "Python code to run")],
        available: true,
        init: Some(probe_python),
        execute: Some(execute_python),
    }
}

fn probe_python() -> crate::Result<()> {
    if std::process::Command::new("python3")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
    {
        Ok(())
    } else {
        Err(crate::Error::config("python3 not found on PATH"))
    }
}

fn execute_python(ctx: ExecuteContext) -> MessageStream {
    Box::pin(async_stream::stream! {
        yield run_python(&ctx.content).await;
    })
}

async fn run_python(code: &str) -> crate::Result<Message> {
    let output = tokio::process::Command::new("python3")
        .arg("-c")
        .arg(code)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| crate::Error::tool_execution(format!("failed to run python3: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let code_str = output.status.code().unwrap_or(-1);

    let mut content = String::from("Executed Python code.\n");
    if !stdout.trim().is_empty() {
        content.push_str(&format!("\nstdout:\n```\n{}\n```\n", stdout.trim_end()));
    }
    if !stderr.trim().is_empty() {
        content.push_str(&format!("\nstderr:\n```\n{}\n```\n", stderr.trim_end()));
    }
    if code_str != 0 {
        content.push_str(&format!("\nReturn code: {code_str}\n"));
    }

    Ok(Message::system(content))
}
