//! External-process pipeline runtime.
//!
//! The scripting runtime that interprets pipeline programs lives outside
//! this codebase. The server invokes it as a subprocess: run context in
//! environment variables, webhook data on stdin, and an optional webhook
//! reply as the last stdout line (a JSON object with a `webhook_reply`
//! key). A non-zero exit is the program's failure.

use async_trait::async_trait;
use conveyor_core::{Error, Result, WebhookReply};
use conveyor_scheduler::{PipelineRuntime, RunContext};
use conveyor_store::PipelineRecord;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

pub struct ProcessRuntime {
    command: String,
}

impl ProcessRuntime {
    /// `command` is resolved through the shell, e.g. `conveyor-runtime`.
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            &std::env::var("CONVEYOR_RUNTIME_CMD").unwrap_or_else(|_| "conveyor-runtime".into()),
        )
    }
}

#[async_trait]
impl PipelineRuntime for ProcessRuntime {
    async fn run(&self, pipeline: &PipelineRecord, ctx: RunContext) -> Result<()> {
        info!(run_id = %ctx.run_id, command = %self.command, "invoking pipeline runtime");

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("CONVEYOR_RUN_ID", &ctx.run_id)
            .env("CONVEYOR_PIPELINE_ID", &ctx.pipeline_id)
            .env("CONVEYOR_PIPELINE_NAME", &pipeline.name)
            .env("CONVEYOR_PIPELINE_CONTENT", &pipeline.content)
            .env("CONVEYOR_DRIVER_DSN", &ctx.driver_dsn)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::Runtime(format!("spawning runtime: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = match &ctx.webhook {
                Some(webhook) => serde_json::to_vec(webhook)
                    .map_err(|e| Error::Runtime(format!("encoding webhook data: {e}")))?,
                None => Vec::new(),
            };
            tokio::spawn(async move {
                let _ = stdin.write_all(&payload).await;
            });
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Runtime(format!("waiting for runtime: {e}")))?;

        // The runtime may hand back a webhook reply as its final stdout
        // line.
        if let Some(reply_slot) = &ctx.reply {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if let Some(line) = stdout.lines().rev().find(|l| !l.trim().is_empty()) {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
                    if let Some(reply) = value.get("webhook_reply") {
                        if let Ok(reply) = serde_json::from_value::<WebhookReply>(reply.clone()) {
                            debug!(run_id = %ctx.run_id, "runtime supplied a webhook reply");
                            reply_slot.send(reply);
                        }
                    }
                }
            }
        }

        if !output.status.success() {
            return Err(Error::Runtime(format!(
                "pipeline program exited with {}",
                output.status.code().unwrap_or(-1)
            )));
        }
        Ok(())
    }
}
