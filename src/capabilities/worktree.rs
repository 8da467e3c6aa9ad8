//! Worktree capability: `create`/`remove` a git worktree for one agent
//! instance. Grounded on the teacher's `GitCli` (`src/git/cli.rs`) and
//! `WorktreeManager` (`src/git/worktree.rs`), generalized from "per-ticket"
//! to "per-instance-id".

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::ErrorCode;

#[derive(Debug, Clone)]
pub struct WorktreeSpec {
    pub name: String,
    pub branch: String,
    pub base_branch: String,
    pub repo_path: PathBuf,
    pub worktrees_root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WorktreeHandle {
    pub path: PathBuf,
    pub branch: String,
}

#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("worktree already exists at {0}")]
    Exists(String),
    #[error("worktree not found at {0}")]
    NotFound(String),
    #[error("worktree at {0} has uncommitted changes")]
    UncommittedChanges(String),
    #[error("base branch {0} not found")]
    BranchNotFound(String),
    #[error("failed to create worktree: {0}")]
    CreationFailed(String),
    #[error("failed to remove worktree: {0}")]
    RemovalFailed(String),
}

impl ErrorCode for WorktreeError {
    fn code(&self) -> &'static str {
        match self {
            WorktreeError::Exists(_) => "WORKTREE_EXISTS",
            WorktreeError::NotFound(_) => "WORKTREE_NOT_FOUND",
            WorktreeError::UncommittedChanges(_) => "WORKTREE_UNCOMMITTED_CHANGES",
            WorktreeError::BranchNotFound(_) => "WORKTREE_BRANCH_NOT_FOUND",
            WorktreeError::CreationFailed(_) => "WORKTREE_CREATION_FAILED",
            WorktreeError::RemovalFailed(_) => "WORKTREE_REMOVAL_FAILED",
        }
    }
}

#[async_trait]
pub trait WorktreeCapability: Send + Sync {
    /// Creates a worktree. Post-condition: either a usable worktree exists
    /// at the returned path, or nothing was created — never a partial one.
    async fn create(&self, spec: &WorktreeSpec) -> Result<WorktreeHandle, WorktreeError>;

    async fn remove(&self, path: &Path) -> Result<(), WorktreeError>;
}

/// Shells out to the real `git` binary, grounded on `GitCli`'s
/// `run_git`/`run_git_silent` helpers and `WorktreeManager::create_for_ticket`.
pub struct GitCliWorktreeCapability;

impl GitCliWorktreeCapability {
    pub fn new() -> Self {
        Self
    }

    async fn run_git(args: &[&str], cwd: &Path) -> Result<String, WorktreeError> {
        debug!(?args, ?cwd, "running git command");

        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| WorktreeError::CreationFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(WorktreeError::CreationFailed(stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for GitCliWorktreeCapability {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorktreeCapability for GitCliWorktreeCapability {
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn create(&self, spec: &WorktreeSpec) -> Result<WorktreeHandle, WorktreeError> {
        let path = spec.worktrees_root.join(&spec.name);

        if path.exists() {
            return Err(WorktreeError::Exists(path.display().to_string()));
        }

        let path_str = path.to_string_lossy().to_string();

        let add = Command::new("git")
            .args([
                "worktree",
                "add",
                "-b",
                &spec.branch,
                &path_str,
                &spec.base_branch,
            ])
            .current_dir(&spec.repo_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| WorktreeError::CreationFailed(e.to_string()))?;

        if !add.status.success() {
            let stderr = String::from_utf8_lossy(&add.stderr).trim().to_string();
            if stderr.contains("already exists") {
                return Err(WorktreeError::Exists(path_str));
            }
            if stderr.contains("unknown revision") || stderr.contains("not a valid ref") {
                return Err(WorktreeError::BranchNotFound(spec.base_branch.clone()));
            }
            // Never leave a half-created directory behind.
            let _ = tokio::fs::remove_dir_all(&path).await;
            return Err(WorktreeError::CreationFailed(stderr));
        }

        Ok(WorktreeHandle {
            path,
            branch: spec.branch.clone(),
        })
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn remove(&self, path: &Path) -> Result<(), WorktreeError> {
        if !path.exists() {
            return Err(WorktreeError::NotFound(path.display().to_string()));
        }

        let repo_root = Self::run_git(&["rev-parse", "--show-toplevel"], path)
            .await
            .unwrap_or_default();
        let search_dir: PathBuf = if repo_root.is_empty() {
            path.parent().map(Path::to_path_buf).unwrap_or_else(|| path.to_path_buf())
        } else {
            PathBuf::from(repo_root)
        };

        let path_str = path.to_string_lossy().to_string();
        let output = Command::new("git")
            .args(["worktree", "remove", "--force", &path_str])
            .current_dir(&search_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| WorktreeError::RemovalFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(error = %stderr, "git worktree remove failed, falling back to rm -rf");
            tokio::fs::remove_dir_all(path)
                .await
                .map_err(|e| WorktreeError::RemovalFailed(e.to_string()))?;
        }

        Ok(())
    }
}

/// In-memory fake for tests — never touches the filesystem or git.
#[derive(Default)]
pub struct FakeWorktreeCapability {
    pub fail_create: parking_lot::Mutex<Option<WorktreeError>>,
    pub removed: parking_lot::Mutex<Vec<PathBuf>>,
}

impl FakeWorktreeCapability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(err: WorktreeError) -> Self {
        Self {
            fail_create: parking_lot::Mutex::new(Some(err)),
            removed: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl WorktreeCapability for FakeWorktreeCapability {
    async fn create(&self, spec: &WorktreeSpec) -> Result<WorktreeHandle, WorktreeError> {
        if let Some(err) = self.fail_create.lock().take() {
            return Err(err);
        }
        Ok(WorktreeHandle {
            path: spec.worktrees_root.join(&spec.name),
            branch: spec.branch.clone(),
        })
    }

    async fn remove(&self, path: &Path) -> Result<(), WorktreeError> {
        self.removed.lock().push(path.to_path_buf());
        Ok(())
    }
}
