//! External hook execution.
//!
//! Each hook runs as a child process in its own process group. The pod state
//! is written to its stdin as JSON, its output is captured and logged, and a
//! hook that outlives its timeout is killed together with everything it
//! spawned.

use crate::error::{Error, HookStage, Result};
use crate::pod::{ContainerInfo, HookSpec, PodId};
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Document a hook receives on stdin.
#[derive(Debug, Serialize)]
pub struct HookPayload<'a> {
    pub stage: &'static str,
    pub id: &'a PodId,
    pub namespace: &'a str,
    pub name: &'a str,
    pub containers: &'a [ContainerInfo],
}

impl HookPayload<'_> {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::serialization)
    }
}

/// Runs hooks with a default timeout.
#[derive(Debug, Clone)]
pub struct HookRunner {
    default_timeout: Duration,
}

impl HookRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    /// Runs `hooks` in order, stopping at the first failure.
    pub async fn run_all(&self, stage: HookStage, hooks: &[HookSpec], input: &[u8]) -> Result<()> {
        for hook in hooks {
            self.run(stage, hook, input).await?;
        }
        Ok(())
    }

    /// Runs one hook to completion.
    ///
    /// # Errors
    ///
    /// - [`Error::HookFailed`] if the hook cannot be spawned or exits non-zero
    /// - [`Error::HookTimeout`] if it runs past its timeout
    pub async fn run(&self, stage: HookStage, hook: &HookSpec, input: &[u8]) -> Result<()> {
        let timeout = hook
            .timeout_secs
            .map_or(self.default_timeout, Duration::from_secs);
        let failed = |reason: String| Error::HookFailed {
            stage,
            path: hook.path.clone(),
            reason,
        };

        let mut child = tokio::process::Command::new(&hook.path)
            .args(&hook.args)
            .envs(&hook.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(format!("spawn: {e}")))?;
        let pgid = child.id();
        debug!(stage = %stage, hook = %hook.path, pid = ?pgid, "Hook started");

        let mut stdin = child.stdin.take();
        let run = async move {
            if let Some(stdin) = stdin.as_mut() {
                // A hook may exit without reading its input.
                if let Err(e) = stdin.write_all(input).await
                    && e.kind() != std::io::ErrorKind::BrokenPipe
                {
                    return Err(e);
                }
            }
            drop(stdin);
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(failed(e.to_string())),
            Err(_) => {
                if let Some(pgid) = pgid {
                    kill_group(pgid);
                }
                warn!(stage = %stage, hook = %hook.path, "Hook timed out after {:?}", timeout);
                return Err(Error::HookTimeout {
                    stage,
                    path: hook.path.clone(),
                    timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() {
            debug!(stage = %stage, hook = %hook.path, "stdout: {}", stdout.trim());
        }
        if !stderr.trim().is_empty() {
            debug!(stage = %stage, hook = %hook.path, "stderr: {}", stderr.trim());
        }

        if !output.status.success() {
            return Err(failed(format!("{}: {}", output.status, stderr.trim())));
        }
        info!(stage = %stage, hook = %hook.path, "Hook completed");
        Ok(())
    }
}

fn kill_group(pgid: u32) {
    let Ok(pgid) = i32::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid only signals that process group.
    let ret = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if ret != 0 {
        debug!(
            "kill(-{}) failed: {}",
            pgid,
            std::io::Error::last_os_error()
        );
    }
}
