use crate::config::Config;
use crate::error::{DispatchError, Result};
use async_trait::async_trait;
use remote::{probe_command, SshOptions};
use std::process::Stdio;
use tokio::process::Command;

/// Answers whether a worker can run ffmpeg right now.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self, hostname: &str) -> Result<()>;
}

/// Runs `ffmpeg -version` on the worker over ssh. One attempt, no retry.
pub struct SshProbe {
    ssh: SshOptions,
    ffmpeg: String,
}

impl SshProbe {
    pub fn new(ssh: SshOptions, ffmpeg: impl Into<String>) -> Self {
        Self {
            ssh,
            ffmpeg: ffmpeg.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.ssh_options(), config.commands.ffmpeg.clone())
    }
}

#[async_trait]
impl ReachabilityProbe for SshProbe {
    async fn probe(&self, hostname: &str) -> Result<()> {
        let argv = probe_command(&self.ssh, &self.ffmpeg, hostname);
        let probe_failed = |reason: String| DispatchError::Probe {
            hostname: hostname.to_string(),
            reason,
        };
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| probe_failed("empty probe command".to_string()))?;
        tracing::debug!(hostname, command = %argv.join(" "), "probing host");

        // stdin stays with the job, which may be reading from a pipe.
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| probe_failed(err.to_string()))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        Err(probe_failed(if stderr.is_empty() {
            output.status.to_string()
        } else {
            format!("{}: {stderr}", output.status)
        }))
    }
}
