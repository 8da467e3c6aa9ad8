//! Resource allocator: composes the capabilities to build and tear down
//! the compound agent resource (§4.3). Pure orchestration — it never
//! reaches the OS directly, only through the injected capabilities and
//! the store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tracing::{error, instrument, warn};

use crate::capabilities::{
    AiLauncherCapability, AiLaunchSpec, MultiplexerCapability, MultiplexerOptions,
    ToolServerHandle, ToolServerSpawner, ToolServerSpec, WorktreeCapability, WorktreeSpec,
};
use crate::clock::Clock;
use crate::error::ErrorCode;
use crate::store::{Instance, InstancePatch, InstanceStatus, InstanceType, Store};

#[derive(Debug, Clone)]
pub struct AllocationSpec {
    pub instance_id: String,
    pub instance_type: InstanceType,
    pub branch: String,
    pub base_branch: String,
    pub repo_path: PathBuf,
    pub worktrees_root: PathBuf,
    pub issue_number: Option<i64>,
    pub parent_instance_id: Option<String>,
    pub ai_command: String,
    pub ai_args: Vec<String>,
    pub tool_server_command: String,
    pub tool_server_args: Vec<String>,
    pub prompt: String,
    pub system_prompt: String,
}

#[derive(Debug, Clone)]
pub struct AllocationResult {
    pub worktree_path: PathBuf,
    pub branch: String,
    pub session_name: String,
    pub ai_session_id: String,
    pub claude_pid: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error(transparent)]
    Capability(#[from] crate::capabilities::CapabilityError),
}

impl ErrorCode for AllocationError {
    fn code(&self) -> &'static str {
        match self {
            AllocationError::Store(e) => e.code(),
            AllocationError::Capability(e) => e.code(),
        }
    }
}

/// Tracks exactly which of steps 2-6 have succeeded so far, so a failure
/// at any point (including step 7's finalize) can drive a reverse-order
/// compensating teardown of only what was actually acquired.
#[derive(Debug, Clone, Default)]
struct Acquired {
    worktree_path: Option<PathBuf>,
    session_name: Option<String>,
    tool_server_spawned: bool,
    ai_pid: Option<u32>,
}

pub struct Allocator {
    worktree: Arc<dyn WorktreeCapability>,
    multiplexer: Arc<dyn MultiplexerCapability>,
    ai_launcher: Arc<dyn AiLauncherCapability>,
    tool_server: Arc<dyn ToolServerSpawner>,
    clock: Arc<dyn Clock>,
    tool_server_handles: Arc<SyncMutex<HashMap<String, Box<dyn ToolServerHandle>>>>,
}

impl Allocator {
    pub fn new(
        worktree: Arc<dyn WorktreeCapability>,
        multiplexer: Arc<dyn MultiplexerCapability>,
        ai_launcher: Arc<dyn AiLauncherCapability>,
        tool_server: Arc<dyn ToolServerSpawner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            worktree,
            multiplexer,
            ai_launcher,
            tool_server,
            clock,
            tool_server_handles: Arc::new(SyncMutex::new(HashMap::new())),
        }
    }

    /// Runs the seven-step acquisition sequence. Failure at step N triggers
    /// compensating teardown for steps `1..N-1`; only step 7 transfers
    /// ownership to the live agent.
    #[instrument(skip(self, store, spec), fields(instance_id = %spec.instance_id))]
    pub async fn allocate(
        &self,
        store: &Store,
        spec: AllocationSpec,
    ) -> Result<AllocationResult, AllocationError> {
        let now = self.clock.now().await;

        // Step 1: reserve instance row with empty resource handles.
        store
            .create_instance(Instance {
                id: spec.instance_id.clone(),
                instance_type: spec.instance_type,
                status: InstanceStatus::Started,
                worktree_path: String::new(),
                branch_name: String::new(),
                tmux_session: String::new(),
                issue_number: spec.issue_number,
                parent_instance_id: spec.parent_instance_id.clone(),
                base_branch: spec.base_branch.clone(),
                agent_number: None,
                system_prompt: spec.system_prompt.clone(),
                prompt_used: String::new(),
                prompt_context: String::new(),
                claude_pid: None,
                created_at: now,
                last_activity: now,
                terminated_at: None,
            })
            .await?;

        match self.acquire_resources(&spec).await {
            Ok((result, acquired)) => {
                // Step 7: finalize the row. Ownership only transfers to the
                // live agent once this lands; a failure here is handled
                // exactly like a steps-2..6 failure (§4.3) — the resources
                // were acquired but never handed off, so they still need
                // compensating teardown.
                match store
                    .update_instance(
                        &spec.instance_id,
                        InstancePatch {
                            worktree_path: Some(result.worktree_path.display().to_string()),
                            branch_name: Some(result.branch.clone()),
                            tmux_session: Some(result.session_name.clone()),
                            claude_pid: Some(i64::from(result.claude_pid)),
                            prompt_used: Some(spec.prompt.clone()),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    Ok(()) => Ok(result),
                    Err(store_err) => {
                        self.teardown(&spec, acquired).await;
                        if let Err(e) = store
                            .update_instance_status(&spec.instance_id, InstanceStatus::Terminated)
                            .await
                        {
                            error!(error = %e, "failed to mark instance terminated after finalize failure");
                        }
                        Err(AllocationError::from(store_err))
                    }
                }
            }
            Err((acquired, err)) => {
                self.teardown(&spec, acquired).await;
                if let Err(store_err) = store
                    .update_instance_status(&spec.instance_id, InstanceStatus::Terminated)
                    .await
                {
                    error!(error = %store_err, "failed to mark instance terminated after allocation failure");
                }
                Err(err)
            }
        }
    }

    /// Steps 2-6. Returns `(result, acquired)` on success — `acquired` is
    /// handed back even on success so a later finalize (step 7) failure can
    /// still tear everything down — or `Err((acquired, error))` where
    /// `acquired` records exactly what was successfully acquired before the
    /// failure, so `teardown` can release it in reverse order.
    async fn acquire_resources(
        &self,
        spec: &AllocationSpec,
    ) -> Result<(AllocationResult, Acquired), (Acquired, AllocationError)> {
        let mut acquired = Acquired::default();

        // Step 2: worktree.
        let worktree_spec = WorktreeSpec {
            name: spec.instance_id.clone(),
            branch: spec.branch.clone(),
            base_branch: spec.base_branch.clone(),
            repo_path: spec.repo_path.clone(),
            worktrees_root: spec.worktrees_root.clone(),
        };
        let worktree = self
            .worktree
            .create(&worktree_spec)
            .await
            .map_err(|e| (acquired.clone(), AllocationError::from(crate::capabilities::CapabilityError::from(e))))?;
        acquired.worktree_path = Some(worktree.path.clone());

        // Step 3: multiplexer session.
        let session = self
            .multiplexer
            .create(
                &spec.instance_id,
                &worktree.path,
                &MultiplexerOptions::default(),
            )
            .await
            .map_err(|e| (acquired.clone(), AllocationError::from(crate::capabilities::CapabilityError::from(e))))?;
        acquired.session_name = Some(session.name.clone());

        // Step 4: tool-server child.
        let tool_server_spec = ToolServerSpec {
            agent_id: spec.instance_id.clone(),
            workspace: worktree.path.clone(),
            branch: worktree.branch.clone(),
            session: session.name.clone(),
            issue_number: spec.issue_number,
            command: spec.tool_server_command.clone(),
            args: spec.tool_server_args.clone(),
        };
        let handle = self
            .tool_server
            .spawn(&tool_server_spec)
            .await
            .map_err(|e| (acquired.clone(), AllocationError::from(crate::capabilities::CapabilityError::from(e))))?;
        self.tool_server_handles
            .lock()
            .insert(spec.instance_id.clone(), handle);
        acquired.tool_server_spawned = true;

        // Step 5: launch the AI session.
        let mut env = HashMap::new();
        env.insert("INSTANCE_ID".to_string(), spec.instance_id.clone());
        env.insert(
            "MCP_SERVER_TYPE".to_string(),
            match spec.instance_type {
                InstanceType::Review => "review".to_string(),
                _ => "coding".to_string(),
            },
        );
        env.insert("MCP_AGENT_ID".to_string(), spec.instance_id.clone());

        let ai_session = self
            .ai_launcher
            .launch(&AiLaunchSpec {
                workspace_path: worktree.path.clone(),
                command: spec.ai_command.clone(),
                args: spec.ai_args.clone(),
                environment_vars: env,
            })
            .await
            .map_err(|e| (acquired.clone(), AllocationError::from(crate::capabilities::CapabilityError::from(e))))?;
        acquired.ai_pid = Some(ai_session.pid);

        // Step 6: inject the prompt.
        self.multiplexer
            .send_keys(&session.name, &spec.prompt)
            .await
            .map_err(|e| (acquired.clone(), AllocationError::from(crate::capabilities::CapabilityError::from(e))))?;

        Ok((
            AllocationResult {
                worktree_path: worktree.path,
                branch: worktree.branch,
                session_name: session.name,
                ai_session_id: ai_session.id,
                claude_pid: ai_session.pid,
            },
            acquired,
        ))
    }

    /// Best-effort reverse-order release of whatever `acquired` records:
    /// AI session -> tool-server -> multiplexer session -> worktree
    /// (§4.3). An individual release failure is logged and does not stop
    /// the remaining releases.
    async fn teardown(&self, spec: &AllocationSpec, acquired: Acquired) {
        if let Some(pid) = acquired.ai_pid {
            if let Err(e) = self.ai_launcher.terminate(pid).await {
                warn!(error = %e, "failed to terminate AI process during teardown");
            }
        }

        if acquired.tool_server_spawned {
            if let Some(mut handle) = self.tool_server_handles.lock().remove(&spec.instance_id) {
                if let Err(e) = handle.kill().await {
                    warn!(error = %e, "failed to kill tool-server during teardown");
                }
            }
        }

        if let Some(ref session_name) = acquired.session_name {
            if let Err(e) = self.multiplexer.kill(session_name).await {
                warn!(error = %e, "failed to kill multiplexer session during teardown");
            }
        }

        if let Some(ref path) = acquired.worktree_path {
            if let Err(e) = self.worktree.remove(path).await {
                warn!(error = %e, "failed to remove worktree during teardown");
            }
        }
    }

    /// Terminates a live agent's resources by instance id, used by
    /// `terminate` for already-allocated instances (not a failed
    /// allocation — the normal teardown path once an instance is live).
    pub async fn release(
        &self,
        instance_id: &str,
        claude_pid: Option<i64>,
        session_name: &str,
        worktree_path: &std::path::Path,
    ) {
        if let Some(pid) = claude_pid {
            if let Ok(pid) = u32::try_from(pid) {
                if let Err(e) = self.ai_launcher.terminate(pid).await {
                    warn!(error = %e, "failed to terminate AI process during release");
                }
            }
        }

        if let Some(mut handle) = self.tool_server_handles.lock().remove(instance_id) {
            if let Err(e) = handle.kill().await {
                warn!(error = %e, "failed to kill tool-server during release");
            }
        }

        if !session_name.is_empty() {
            if let Err(e) = self.multiplexer.kill(session_name).await {
                warn!(error = %e, "failed to kill multiplexer session during release");
            }
        }

        if worktree_path.as_os_str().len() > 0 {
            if let Err(e) = self.worktree.remove(worktree_path).await {
                warn!(error = %e, "failed to remove worktree during release");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{
        FakeAiLauncherCapability, FakeMultiplexerCapability, FakeToolServerSpawner,
        FakeWorktreeCapability,
    };
    use crate::clock::SystemClock;

    fn spec(id: &str, repo: PathBuf, worktrees: PathBuf) -> AllocationSpec {
        AllocationSpec {
            instance_id: id.to_string(),
            instance_type: InstanceType::Coding,
            branch: format!("agent/{id}"),
            base_branch: "main".to_string(),
            repo_path: repo,
            worktrees_root: worktrees,
            issue_number: Some(123),
            parent_instance_id: None,
            ai_command: "true".to_string(),
            ai_args: vec![],
            tool_server_command: "true".to_string(),
            tool_server_args: vec![],
            prompt: "do the thing".to_string(),
            system_prompt: "you are an agent".to_string(),
        }
    }

    #[tokio::test]
    async fn allocation_failure_rolls_back_and_marks_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().await.unwrap();
        let worktree = Arc::new(FakeWorktreeCapability::new());
        let multiplexer = Arc::new(FakeMultiplexerCapability::failing(
            crate::capabilities::multiplexer::MultiplexerError::CommandFailed("boom".into()),
        ));
        let allocator = Allocator::new(
            worktree.clone(),
            multiplexer,
            Arc::new(FakeAiLauncherCapability::new()),
            Arc::new(FakeToolServerSpawner::new()),
            Arc::new(SystemClock),
        );

        let s = spec("work-123-a1", dir.path().to_path_buf(), dir.path().to_path_buf());
        let err = allocator.allocate(&store, s).await.unwrap_err();
        assert_eq!(err.code(), "MULTIPLEXER_COMMAND_FAILED");

        assert_eq!(worktree.removed.lock().len(), 1);

        let row = store.get_instance("work-123-a1").await.unwrap().unwrap();
        assert_eq!(row.status, InstanceStatus::Terminated);
        assert!(row.terminated_at.is_some());
    }

    #[tokio::test]
    async fn happy_path_finalizes_instance_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().await.unwrap();
        let allocator = Allocator::new(
            Arc::new(FakeWorktreeCapability::new()),
            Arc::new(FakeMultiplexerCapability::new()),
            Arc::new(FakeAiLauncherCapability::new()),
            Arc::new(FakeToolServerSpawner::new()),
            Arc::new(SystemClock),
        );

        let s = spec("work-123-a2", dir.path().to_path_buf(), dir.path().to_path_buf());
        let result = allocator.allocate(&store, s).await.unwrap();
        assert!(!result.session_name.is_empty());

        let row = store.get_instance("work-123-a2").await.unwrap().unwrap();
        assert_eq!(row.status, InstanceStatus::Started);
        assert!(!row.worktree_path.is_empty());
        assert!(row.claude_pid.is_some());
    }

    /// Simulates the reserved row vanishing underneath an in-flight
    /// allocation (e.g. a concurrent `terminate`/delete) so step 7's
    /// `update_instance` fails after steps 2-6 already succeeded. That
    /// failure must still roll back the acquired resources and mark the
    /// row terminated rather than leaking them silently.
    struct RowDeletingAiLauncher {
        store: Arc<Store>,
        instance_id: String,
        inner: FakeAiLauncherCapability,
    }

    #[async_trait::async_trait]
    impl AiLauncherCapability for RowDeletingAiLauncher {
        async fn launch(
            &self,
            spec: &crate::capabilities::AiLaunchSpec,
        ) -> Result<crate::capabilities::AiSession, crate::capabilities::ai_launcher::AiLauncherError>
        {
            self.store
                .delete_instance(&self.instance_id)
                .await
                .expect("row must exist to delete");
            self.inner.launch(spec).await
        }

        async fn terminate(
            &self,
            pid: u32,
        ) -> Result<(), crate::capabilities::ai_launcher::AiLauncherError> {
            self.inner.terminate(pid).await
        }
    }

    #[tokio::test]
    async fn finalize_failure_tears_down_acquired_resources_and_marks_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let worktree = Arc::new(FakeWorktreeCapability::new());
        let multiplexer = Arc::new(FakeMultiplexerCapability::new());
        let allocator = Allocator::new(
            worktree.clone(),
            multiplexer.clone(),
            Arc::new(RowDeletingAiLauncher {
                store: store.clone(),
                instance_id: "work-123-a3".to_string(),
                inner: FakeAiLauncherCapability::new(),
            }),
            Arc::new(FakeToolServerSpawner::new()),
            Arc::new(SystemClock),
        );

        let s = spec("work-123-a3", dir.path().to_path_buf(), dir.path().to_path_buf());
        let err = allocator.allocate(&store, s).await.unwrap_err();
        assert_eq!(err.code(), "DATABASE_UPDATE_FAILED");

        // The multiplexer session and worktree acquired in steps 2-3 were
        // torn down rather than leaked, even though the row they would
        // have been recorded against is already gone.
        assert!(!multiplexer.session_exists("work-123-a3").await.unwrap());
        assert_eq!(worktree.removed.lock().len(), 1);
        assert!(store.get_instance("work-123-a3").await.unwrap().is_none());
    }
}
