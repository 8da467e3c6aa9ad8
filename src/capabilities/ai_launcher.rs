//! AI-launcher capability: starts the child AI process inside an already
//! running multiplexer session and reports back its process id. Grounded
//! on the teacher's launcher process-spawn machinery
//! (`src/agents/launcher/mod.rs`, `llm_command`), generalized here from a
//! concrete CLI-detection routine into an injected trait.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::instrument;

use crate::error::ErrorCode;

#[derive(Debug, Clone)]
pub struct AiLaunchSpec {
    pub workspace_path: PathBuf,
    pub command: String,
    pub args: Vec<String>,
    pub environment_vars: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct AiSession {
    pub id: String,
    pub pid: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum AiLauncherError {
    #[error("AI command not found: {0}")]
    CommandNotFound(String),
    #[error("failed to launch AI process: {0}")]
    LaunchFailed(String),
    #[error("failed to terminate AI process: {0}")]
    TerminationFailed(String),
}

impl ErrorCode for AiLauncherError {
    fn code(&self) -> &'static str {
        match self {
            AiLauncherError::CommandNotFound(_) => "AI_LAUNCHER_COMMAND_NOT_FOUND",
            AiLauncherError::LaunchFailed(_) => "AI_LAUNCHER_LAUNCH_FAILED",
            AiLauncherError::TerminationFailed(_) => "AI_LAUNCHER_TERMINATION_FAILED",
        }
    }
}

#[async_trait]
pub trait AiLauncherCapability: Send + Sync {
    async fn launch(&self, spec: &AiLaunchSpec) -> Result<AiSession, AiLauncherError>;

    async fn terminate(&self, pid: u32) -> Result<(), AiLauncherError>;
}

/// Spawns the configured AI CLI as a detached child process.
pub struct ProcessAiLauncher;

impl ProcessAiLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ProcessAiLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AiLauncherCapability for ProcessAiLauncher {
    #[instrument(skip(self, spec), fields(command = %spec.command))]
    async fn launch(&self, spec: &AiLaunchSpec) -> Result<AiSession, AiLauncherError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .current_dir(&spec.workspace_path)
            .envs(&spec.environment_vars)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AiLauncherError::CommandNotFound(spec.command.clone())
            } else {
                AiLauncherError::LaunchFailed(e.to_string())
            }
        })?;

        let pid = child.id().ok_or_else(|| {
            AiLauncherError::LaunchFailed("child process exited before pid was observed".into())
        })?;

        // The child is intentionally detached: it outlives this call and is
        // supervised by the instance's multiplexer session, not by us.
        std::mem::forget(child);

        Ok(AiSession {
            id: uuid::Uuid::new_v4().to_string(),
            pid,
        })
    }

    async fn terminate(&self, pid: u32) -> Result<(), AiLauncherError> {
        #[cfg(unix)]
        {
            let result = Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .output()
                .await
                .map_err(|e| AiLauncherError::TerminationFailed(e.to_string()))?;
            if !result.status.success() {
                let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
                // Already-exited processes are not a teardown failure.
                if !stderr.contains("No such process") {
                    return Err(AiLauncherError::TerminationFailed(stderr));
                }
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            Ok(())
        }
    }
}

/// In-memory fake for tests.
#[derive(Default)]
pub struct FakeAiLauncherCapability {
    pub fail_launch: parking_lot::Mutex<Option<AiLauncherError>>,
    pub terminated: parking_lot::Mutex<Vec<u32>>,
    next_pid: std::sync::atomic::AtomicU32,
}

impl FakeAiLauncherCapability {
    pub fn new() -> Self {
        Self {
            fail_launch: parking_lot::Mutex::new(None),
            terminated: parking_lot::Mutex::new(Vec::new()),
            next_pid: std::sync::atomic::AtomicU32::new(1000),
        }
    }

    pub fn failing(err: AiLauncherError) -> Self {
        let fake = Self::new();
        *fake.fail_launch.lock() = Some(err);
        fake
    }
}

#[async_trait]
impl AiLauncherCapability for FakeAiLauncherCapability {
    async fn launch(&self, _spec: &AiLaunchSpec) -> Result<AiSession, AiLauncherError> {
        if let Some(err) = self.fail_launch.lock().take() {
            return Err(err);
        }
        let pid = self
            .next_pid
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(AiSession {
            id: format!("fake-session-{pid}"),
            pid,
        })
    }

    async fn terminate(&self, pid: u32) -> Result<(), AiLauncherError> {
        self.terminated.lock().push(pid);
        Ok(())
    }
}
