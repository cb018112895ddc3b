//! Agent runtime backed by a child process speaking JSON lines.
//!
//! The harness writes one `start` event to the child's stdin, then reads
//! events from its stdout. Every `permission_request` is answered on stdin
//! with a `permission_response` carrying the coordinator's verdict before the
//! next line is read, so the agent cannot run ahead of a pending approval.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tracing::{debug, instrument, warn};

use crate::coordinator::{AgentRuntime, PermissionResult, RunContext};
use crate::protocol::{AgentMessage, MessageRole};

const STDERR_TAIL_BYTES: usize = 4096;

/// Event read from the agent's stdout.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentEvent {
    PermissionRequest {
        id: String,
        tool_name: String,
        #[serde(default)]
        tool_input: Value,
    },
    Message {
        #[serde(default = "assistant_role")]
        role: MessageRole,
        content: String,
    },
}

fn assistant_role() -> MessageRole {
    MessageRole::Assistant
}

/// Event written to the agent's stdin.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HostEvent<'a> {
    Start {
        session_id: &'a str,
        prompt: &'a str,
        working_directory: &'a Path,
    },
    PermissionResponse {
        id: &'a str,
        result: &'a PermissionResult,
    },
}

/// Runs `agent.command` once per session.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    program: String,
    args: Vec<String>,
}

impl ProcessRuntime {
    /// `None` when `command` is empty.
    pub fn from_command(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl AgentRuntime for ProcessRuntime {
    #[instrument(skip_all, fields(session_id = %ctx.session_id, program = %self.program))]
    async fn run(&self, ctx: RunContext) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&ctx.workdir)
            .env("HARNESS_SESSION_ID", &ctx.session_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn agent {}", self.program))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        let stderr_task = tokio::spawn(read_tail(stderr, STDERR_TAIL_BYTES));

        send(
            &mut stdin,
            &HostEvent::Start {
                session_id: &ctx.session_id,
                prompt: &ctx.prompt,
                working_directory: &ctx.workdir,
            },
        )
        .await?;

        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line.context("read agent stdout")?,
                () = ctx.cancel.cancelled() => {
                    warn!("session cancelled; killing agent");
                    child.kill().await.context("kill agent")?;
                    return Ok(());
                }
            };
            let Some(line) = line else {
                break;
            };
            handle_line(&ctx, &mut stdin, &line).await?;
        }
        drop(stdin);

        let status = child.wait().await.context("wait for agent")?;
        let stderr_tail = stderr_task.await.unwrap_or_default();
        debug!(exit_code = ?status.code(), "agent exited");
        if status.success() {
            Ok(())
        } else if stderr_tail.is_empty() {
            Err(anyhow!("agent exited with {status}"))
        } else {
            Err(anyhow!("agent exited with {status}: {stderr_tail}"))
        }
    }
}

async fn handle_line(ctx: &RunContext, stdin: &mut ChildStdin, line: &str) -> Result<()> {
    if line.trim().is_empty() {
        return Ok(());
    }
    let event: AgentEvent = match serde_json::from_str(line) {
        Ok(event) => event,
        Err(err) => {
            warn!(err = %err, "ignoring malformed agent output line");
            return Ok(());
        }
    };
    match event {
        AgentEvent::Message { role, content } => {
            ctx.gate.emit(AgentMessage::new(role, content)).await;
        }
        AgentEvent::PermissionRequest {
            id,
            tool_name,
            tool_input,
        } => {
            let result = ctx.gate.check_permission(&tool_name, tool_input).await;
            send(
                stdin,
                &HostEvent::PermissionResponse {
                    id: &id,
                    result: &result,
                },
            )
            .await?;
        }
    }
    Ok(())
}

async fn send(stdin: &mut ChildStdin, event: &HostEvent<'_>) -> Result<()> {
    let mut line = serde_json::to_string(event).context("encode host event")?;
    line.push('\n');
    stdin
        .write_all(line.as_bytes())
        .await
        .context("write agent stdin")?;
    stdin.flush().await.context("flush agent stdin")
}

/// Drain `stream`, keeping at most the last `limit` bytes.
async fn read_tail(mut stream: impl AsyncRead + Unpin, limit: usize) -> String {
    let mut tail = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > limit {
                    tail.drain(..tail.len() - limit);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).trim().to_string()
}
