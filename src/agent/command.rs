//! Agent invocation through an external command.

use crate::agent::AgentInvoker;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Runs `program args..` in the workspace, writes the prompt to stdin and
/// takes stdout as the reply.
///
/// The child is killed if it outlives the timeout.
pub struct CommandInvoker {
    program: String,
    args: Vec<String>,
    cwd: PathBuf,
    timeout: Duration,
}

impl CommandInvoker {
    pub fn new(program: &str, args: &[String], cwd: &Path, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            args: args.to_vec(),
            cwd: cwd.to_path_buf(),
            timeout,
        }
    }
}

#[async_trait]
impl AgentInvoker for CommandInvoker {
    async fn invoke(&self, prompt: &str) -> Result<String> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.cwd.is_dir() {
            command.current_dir(&self.cwd);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to start agent command '{}'", self.program))?;

        // The prompt is fed from its own task so a child that never reads
        // stdin cannot stall us past the deadline. Dropping stdin after the
        // write gives the agent EOF.
        let writer = child.stdin.take().map(|mut stdin| {
            let prompt = prompt.as_bytes().to_vec();
            tokio::spawn(async move { stdin.write_all(&prompt).await })
        });

        let run = async {
            let output = child.wait_with_output().await.context("Agent command failed")?;
            if let Some(writer) = writer {
                match writer.await.context("Prompt writer task failed")? {
                    Ok(()) => {}
                    // Exited without reading; the exit status tells the story.
                    Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {}
                    Err(err) => return Err(err).context("Failed to write prompt to agent"),
                }
            }
            Ok::<Output, anyhow::Error>(output)
        };

        // Timing out drops `run`, and with it the child (kill_on_drop).
        let output: Output = match tokio::time::timeout(self.timeout, run).await {
            Ok(output) => output?,
            Err(_) => bail!("Agent command timed out after {}s", self.timeout.as_secs_f64()),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Agent command exited with {}: {}", output.status, stderr.trim());
        }

        let reply = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!("Agent replied with {} bytes", reply.len());
        Ok(reply)
    }
}
