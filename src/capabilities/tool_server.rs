//! Tool-server spawner: starts the companion child process that brokers
//! tool calls between the AI process and the host. The process itself is
//! out of scope (§1); this capability only spawns it and holds a handle
//! that can be killed on teardown.

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::instrument;

use crate::error::ErrorCode;

#[derive(Debug, Clone)]
pub struct ToolServerSpec {
    pub agent_id: String,
    pub workspace: std::path::PathBuf,
    pub branch: String,
    pub session: String,
    pub issue_number: Option<i64>,
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolServerError {
    #[error("failed to spawn tool-server process: {0}")]
    SpawnFailed(String),
    #[error("tool-server process did not signal readiness")]
    NotReady,
    #[error("failed to kill tool-server process: {0}")]
    KillFailed(String),
}

impl ErrorCode for ToolServerError {
    fn code(&self) -> &'static str {
        match self {
            ToolServerError::SpawnFailed(_) => "TOOL_SERVER_SPAWN_FAILED",
            ToolServerError::NotReady => "TOOL_SERVER_NOT_READY",
            ToolServerError::KillFailed(_) => "TOOL_SERVER_KILL_FAILED",
        }
    }
}

/// An owning handle to a live tool-server child process.
#[async_trait]
pub trait ToolServerHandle: Send + Sync {
    async fn kill(&mut self) -> Result<(), ToolServerError>;

    fn killed(&self) -> bool;
}

#[async_trait]
pub trait ToolServerSpawner: Send + Sync {
    async fn spawn(
        &self,
        spec: &ToolServerSpec,
    ) -> Result<Box<dyn ToolServerHandle>, ToolServerError>;
}

pub struct ProcessToolServerHandle {
    child: Option<Child>,
    killed: bool,
}

#[async_trait]
impl ToolServerHandle for ProcessToolServerHandle {
    async fn kill(&mut self) -> Result<(), ToolServerError> {
        if let Some(mut child) = self.child.take() {
            child
                .kill()
                .await
                .map_err(|e| ToolServerError::KillFailed(e.to_string()))?;
        }
        self.killed = true;
        Ok(())
    }

    fn killed(&self) -> bool {
        self.killed
    }
}

/// Spawns the configured tool-server binary as a child process, passing
/// agent context through environment variables.
pub struct ProcessToolServerSpawner;

impl ProcessToolServerSpawner {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ProcessToolServerSpawner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolServerSpawner for ProcessToolServerSpawner {
    #[instrument(skip(self, spec), fields(agent_id = %spec.agent_id))]
    async fn spawn(
        &self,
        spec: &ToolServerSpec,
    ) -> Result<Box<dyn ToolServerHandle>, ToolServerError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .current_dir(&spec.workspace)
            .env("TOOL_SERVER_AGENT_ID", &spec.agent_id)
            .env("TOOL_SERVER_BRANCH", &spec.branch)
            .env("TOOL_SERVER_SESSION", &spec.session)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        if let Some(issue) = spec.issue_number {
            cmd.env("TOOL_SERVER_ISSUE_NUMBER", issue.to_string());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ToolServerError::SpawnFailed(e.to_string()))?;

        // The tool-server process itself is out of scope (§1); readiness is
        // approximated by giving it a brief window to come up and checking
        // it hasn't already exited, rather than speaking its internal
        // protocol.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        if child.try_wait().map_err(|e| ToolServerError::SpawnFailed(e.to_string()))?.is_some() {
            return Err(ToolServerError::NotReady);
        }

        Ok(Box::new(ProcessToolServerHandle {
            child: Some(child),
            killed: false,
        }))
    }
}

/// In-memory fake handle/spawner for tests.
pub struct FakeToolServerHandle {
    pub killed: bool,
}

#[async_trait]
impl ToolServerHandle for FakeToolServerHandle {
    async fn kill(&mut self) -> Result<(), ToolServerError> {
        self.killed = true;
        Ok(())
    }

    fn killed(&self) -> bool {
        self.killed
    }
}

#[derive(Default)]
pub struct FakeToolServerSpawner {
    pub fail_spawn: parking_lot::Mutex<Option<ToolServerError>>,
}

impl FakeToolServerSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(err: ToolServerError) -> Self {
        Self {
            fail_spawn: parking_lot::Mutex::new(Some(err)),
        }
    }
}

#[async_trait]
impl ToolServerSpawner for FakeToolServerSpawner {
    async fn spawn(
        &self,
        _spec: &ToolServerSpec,
    ) -> Result<Box<dyn ToolServerHandle>, ToolServerError> {
        if let Some(err) = self.fail_spawn.lock().take() {
            return Err(err);
        }
        Ok(Box::new(FakeToolServerHandle { killed: false }))
    }
}
