//! Backend that runs a CLI agent as a child process.
//!
//! The prompt is written to the child's stdin; stdout is the reply. Cancellation
//! kills the child.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use parley_core::content::ContentBlock;

use crate::backend::{BackendEvent, BackendResponse, BackendStream, ExecutionBackend, TurnContext};
use crate::error::BackendError;

const MAX_OUTPUT_BYTES: usize = 1_000_000;
const STREAM_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct ProcessConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

pub struct ProcessBackend {
    config: ProcessConfig,
}

impl ProcessBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            config: ProcessConfig {
                program: program.into(),
                args,
                env: Vec::new(),
            },
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.push((key.into(), value.into()));
        self
    }

    async fn spawn(&self, ctx: &TurnContext, content: &[ContentBlock]) -> Result<Child, BackendError> {
        let mut cmd = Command::new(&self.config.program);
        let _ = cmd
            .args(&self.config.args)
            .envs(self.config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("PARLEY_CONVERSATION_ID", ctx.conversation_id.as_str())
            .env("PARLEY_TURN_ID", ctx.turn_id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &ctx.cwd {
            let _ = cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            BackendError::Unavailable(format!("failed to start {}: {e}", self.config.program))
        })?;
        debug!(program = %self.config.program, pid = ?child.id(), "backend process started");

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = render_prompt(content);
            // A child that never reads its input is not an error.
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                warn!(error = %e, "failed to write prompt to backend stdin");
            }
        }
        Ok(child)
    }
}

/// Flatten content into the plain-text prompt a CLI agent reads.
pub fn render_prompt(content: &[ContentBlock]) -> String {
    let mut out = String::new();
    for block in content {
        let piece = match block {
            ContentBlock::Text(t) => t.text.clone(),
            ContentBlock::Image(i) => format!("[image: {}]", i.mime_type),
            ContentBlock::Audio(a) => format!("[audio: {}]", a.mime_type),
            ContentBlock::Resource(r) => match &r.resource.text {
                Some(text) => format!("<resource uri=\"{}\">\n{text}\n</resource>", r.resource.uri),
                None => format!("[resource: {}]", r.resource.uri),
            },
            ContentBlock::ResourceLink(l) => format!("[{}]({})", l.name, l.uri),
        };
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&piece);
    }
    out
}

fn truncate(mut text: String) -> String {
    if text.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n[truncated]");
    }
    text
}

fn exit_response(status: std::process::ExitStatus, output: String, stderr: &str) -> BackendResponse {
    let code = status.code().unwrap_or(-1);
    let response = if status.success() {
        BackendResponse::ok(output)
    } else {
        let error = if stderr.trim().is_empty() {
            format!("exit code {code}")
        } else {
            stderr.trim().to_string()
        };
        BackendResponse {
            output,
            ..BackendResponse::failure(error)
        }
    };
    response.with_metadata("exitCode", json!(code))
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    fn name(&self) -> &str {
        &self.config.program
    }

    async fn send(
        &self,
        ctx: &TurnContext,
        content: &[ContentBlock],
    ) -> Result<BackendResponse, BackendError> {
        let child = self.spawn(ctx, content).await?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            out = child.wait_with_output() => out.map_err(|e| BackendError::Process(e.to_string()))?,
            _ = ctx.cancel.cancelled() => return Err(BackendError::Cancelled),
        };

        let stdout = truncate(String::from_utf8_lossy(&output.stdout).into_owned());
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(exit_response(output.status, stdout, &stderr))
    }

    async fn send_streaming(
        &self,
        ctx: &TurnContext,
        content: &[ContentBlock],
    ) -> Result<BackendStream, BackendError> {
        let mut child = self.spawn(ctx, content).await?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Process("stdout not captured".into()))?;
        let mut stderr = child.stderr.take();
        let cancel = ctx.cancel.clone();
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let stderr_task = tokio::spawn(async move {
                let mut buf = String::new();
                if let Some(stderr) = stderr.as_mut() {
                    let _ = stderr.read_to_string(&mut buf).await;
                }
                buf
            });

            let mut reader = BufReader::new(stdout);
            let mut line = Vec::new();
            let mut collected = String::new();
            loop {
                line.clear();
                let read = tokio::select! {
                    r = reader.read_until(b'\n', &mut line) => r,
                    _ = cancel.cancelled() => {
                        let _ = child.kill().await;
                        return;
                    }
                };
                match read {
                    Ok(0) => break,
                    Ok(_) => {
                        let chunk = String::from_utf8_lossy(&line).into_owned();
                        if collected.len() < MAX_OUTPUT_BYTES {
                            collected.push_str(&chunk);
                        }
                        if tx.send(BackendEvent::Chunk(chunk)).await.is_err() {
                            // Receiver gone: nobody wants the rest.
                            let _ = child.kill().await;
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = child.kill().await;
                        let _ = tx
                            .send(BackendEvent::Done(BackendResponse::failure(format!(
                                "failed to read backend output: {e}"
                            ))))
                            .await;
                        return;
                    }
                }
            }

            let response = match child.wait().await {
                Ok(status) => {
                    let stderr = stderr_task.await.unwrap_or_default();
                    exit_response(status, truncate(collected), &stderr)
                }
                Err(e) => BackendResponse::failure(e.to_string()),
            };
            let _ = tx.send(BackendEvent::Done(response)).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
