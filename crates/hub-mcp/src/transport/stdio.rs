//! Stdio launcher for process-based providers

use async_trait::async_trait;
use hub_config::LaunchSpec;
use hub_core::{HubError, Result};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use super::{ExitInfo, Launcher, ProcessHandle, Spawned};

/// Launches providers as child processes speaking JSON-RPC over stdio.
#[derive(Debug, Default, Clone)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, name: &str, spec: &LaunchSpec) -> Result<Spawned> {
        info!("Starting provider '{}' via stdio: {} {:?}", name, spec.command, spec.args);

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| HubError::startup(name, format!("failed to spawn '{}': {}", spec.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HubError::startup(name, "failed to get process stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HubError::startup(name, "failed to get process stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(name.to_string(), stderr));
        }

        debug!("Provider '{}' running as pid {:?}", name, child.id());
        Ok(Spawned {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: Box::new(ChildProcess { child }),
        })
    }
}

/// Provider diagnostics go to our log, never to the host stream.
async fn log_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    debug!(provider = %name, "stderr: {}", trimmed);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(provider = %name, "error reading stderr: {}", e);
                break;
            }
        }
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<ExitInfo> {
        let status = self.child.wait().await?;
        Ok(ExitInfo {
            code: status.code(),
            success: status.success(),
        })
    }

    async fn kill(&mut self) -> Result<()> {
        match self.child.kill().await {
            Ok(()) => Ok(()),
            // Already reaped
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
