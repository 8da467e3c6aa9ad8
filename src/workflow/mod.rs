//! Workflow engine: the state machine and public API described in §4.1 —
//! `execute`, `terminate`, `getState`, `requestReview`. The engine holds no
//! mutable state of its own beyond the allocator's tool-server handle map
//! (§4.3), a per-instance lock map, and a small map tracking the
//! `max_reviews` each instance was launched or last reviewed with (§9,
//! "Open question (resolved)": `getState` reports the value actually
//! supplied rather than a value recomputed from config).

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::instrument;

use crate::allocator::{AllocationError, AllocationSpec, Allocator};
use crate::clock::Clock;
use crate::error::ErrorCode;
use crate::store::{InstanceStatus, InstanceType, NewEvent, Store};

/// Hard-coded engine-wide fallback, matching the source's observed
/// behavior (§9): `max_reviews` is not read from persisted config.
pub const DEFAULT_MAX_REVIEWS: i64 = 3;

const SPAWNED_REVIEW: &str = "spawned_review";

/// Input to `execute` (§4.1). Carries everything the allocator needs to
/// build the compound resource plus the caller's review budget.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
    pub instance_type: InstanceType,
    pub issue_number: Option<i64>,
    pub target_branch: Option<String>,
    pub base_branch: String,
    pub repo_path: PathBuf,
    pub worktrees_root: PathBuf,
    pub parent_instance_id: Option<String>,
    pub ai_command: String,
    pub ai_args: Vec<String>,
    pub tool_server_command: String,
    pub tool_server_args: Vec<String>,
    pub system_prompt: String,
    pub prompt: String,
    pub max_reviews: i64,
}

impl Default for ExecuteConfig {
    fn default() -> Self {
        Self {
            instance_type: InstanceType::Coding,
            issue_number: None,
            target_branch: None,
            base_branch: String::new(),
            repo_path: PathBuf::new(),
            worktrees_root: PathBuf::new(),
            parent_instance_id: None,
            ai_command: String::new(),
            ai_args: Vec::new(),
            tool_server_command: String::new(),
            tool_server_args: Vec::new(),
            system_prompt: String::new(),
            prompt: String::new(),
            max_reviews: DEFAULT_MAX_REVIEWS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionResources {
    pub worktree_path: String,
    pub session_name: String,
    pub branch: String,
    pub ai_session_id: String,
}

/// What `execute` hands back to the caller (§4.1).
#[derive(Debug, Clone)]
pub struct ExecutionDescriptor {
    pub id: String,
    pub instance_type: InstanceType,
    pub status: InstanceStatus,
    pub resources: ExecutionResources,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The phase a caller sees, derived from `status` (§4.1). Distinct from
/// `InstanceStatus` because it collapses non-terminal PR states and any
/// future status into `Working` rather than exposing raw wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Working,
    ReviewRequested,
    PrCreated,
    Terminated,
}

impl Phase {
    fn from_status(status: InstanceStatus) -> Self {
        match status {
            InstanceStatus::Started => Phase::Working,
            InstanceStatus::WaitingReview => Phase::ReviewRequested,
            InstanceStatus::PrCreated => Phase::PrCreated,
            InstanceStatus::Terminated => Phase::Terminated,
            // pr_merged / pr_closed are terminal but not named explicitly
            // in the phase table (§4.1); they still read as "terminated".
            InstanceStatus::PrMerged | InstanceStatus::PrClosed => Phase::Terminated,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Working => "working",
            Phase::ReviewRequested => "review_requested",
            Phase::PrCreated => "pr_created",
            Phase::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowState {
    pub phase: Phase,
    pub review_count: i64,
    pub max_reviews: i64,
    pub current_review_instance_id: Option<String>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("instance {0} not found")]
    InstanceNotFound(String),

    #[error("instance {id} is {current_status}, cannot {requested_transition}")]
    InvalidState {
        id: String,
        current_status: String,
        requested_transition: String,
    },

    #[error("instance {id} has {review_count} outstanding reviews (max {max_reviews})")]
    MaxReviewsExceeded {
        id: String,
        review_count: i64,
        max_reviews: i64,
    },

    #[error("instance {0} already has a review in progress")]
    ReviewInProgress(String),

    #[error("cleanup failed: {0}")]
    CleanupFailed(String),

    #[error("validation failed: {0}")]
    Validation(String),
}

impl ErrorCode for WorkflowError {
    fn code(&self) -> &'static str {
        match self {
            WorkflowError::Store(e) => e.code(),
            WorkflowError::Allocation(e) => e.code(),
            WorkflowError::InstanceNotFound(_) => "WORKFLOW_INSTANCE_NOT_FOUND",
            WorkflowError::InvalidState { .. } => "WORKFLOW_INVALID_STATE",
            WorkflowError::MaxReviewsExceeded { .. } => "WORKFLOW_MAX_REVIEWS_EXCEEDED",
            WorkflowError::ReviewInProgress(_) => "WORKFLOW_REVIEW_IN_PROGRESS",
            WorkflowError::CleanupFailed(_) => "WORKFLOW_CLEANUP_FAILED",
            WorkflowError::Validation(_) => "VALIDATION_FAILED",
        }
    }
}

/// Derives `work-{issue_number | "custom"}-{unix_millis}-{random9}` (§6).
fn generate_instance_id(issue_number: Option<i64>, now: DateTime<Utc>) -> String {
    const ALPHABET: [char; 36] = [
        '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h',
        'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
    ];
    let prefix = issue_number
        .map(|n| n.to_string())
        .unwrap_or_else(|| "custom".to_string());
    let random = nanoid::nanoid!(9, &ALPHABET);
    format!("work-{prefix}-{}-{random}", now.timestamp_millis())
}

pub struct WorkflowEngine {
    store: Arc<Store>,
    allocator: Arc<Allocator>,
    clock: Arc<dyn Clock>,
    locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    max_reviews: SyncMutex<HashMap<String, i64>>,
    default_max_reviews: i64,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<Store>,
        allocator: Arc<Allocator>,
        clock: Arc<dyn Clock>,
        default_max_reviews: i64,
    ) -> Self {
        Self {
            store,
            allocator,
            clock,
            locks: SyncMutex::new(HashMap::new()),
            max_reviews: SyncMutex::new(HashMap::new()),
            default_max_reviews,
        }
    }

    async fn lock_for(&self, id: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock();
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    /// Drops the per-id lock entry once a terminal transition lands and no
    /// other waiter is holding a reference (§9: "entry cleanup on terminal
    /// transitions").
    fn forget_lock(&self, id: &str) {
        let mut locks = self.locks.lock();
        if locks.get(id).is_some_and(|m| Arc::strong_count(m) == 1) {
            locks.remove(id);
        }
    }

    /// Creates a new instance and launches it (§4.1, §4.3). Fails on
    /// validation before any state change; an allocation failure leaves
    /// the instance row `terminated` and propagates the allocator's
    /// original error (§7).
    #[instrument(skip(self, config), fields(issue = ?config.issue_number))]
    pub async fn execute(
        &self,
        config: ExecuteConfig,
    ) -> Result<ExecutionDescriptor, WorkflowError> {
        if config.base_branch.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "base_branch must not be empty".to_string(),
            ));
        }
        if config.issue_number.is_some_and(|n| n < 0) {
            return Err(WorkflowError::Validation(
                "issue_number must not be negative".to_string(),
            ));
        }
        if config.max_reviews < 0 {
            return Err(WorkflowError::Validation(
                "max_reviews must not be negative".to_string(),
            ));
        }

        let now = self.clock.now().await;
        let id = generate_instance_id(config.issue_number, now);
        let branch = config
            .target_branch
            .clone()
            .unwrap_or_else(|| format!("agent/{id}"));

        let _guard = self.lock_for(&id).await;

        let spec = AllocationSpec {
            instance_id: id.clone(),
            instance_type: config.instance_type,
            branch,
            base_branch: config.base_branch.clone(),
            repo_path: config.repo_path.clone(),
            worktrees_root: config.worktrees_root.clone(),
            issue_number: config.issue_number,
            parent_instance_id: config.parent_instance_id.clone(),
            ai_command: config.ai_command.clone(),
            ai_args: config.ai_args.clone(),
            tool_server_command: config.tool_server_command.clone(),
            tool_server_args: config.tool_server_args.clone(),
            prompt: config.prompt.clone(),
            system_prompt: config.system_prompt.clone(),
        };

        let result = self.allocator.allocate(&self.store, spec).await?;

        self.max_reviews.lock().insert(id.clone(), config.max_reviews);

        Ok(ExecutionDescriptor {
            id,
            instance_type: config.instance_type,
            status: InstanceStatus::Started,
            resources: ExecutionResources {
                worktree_path: result.worktree_path.display().to_string(),
                session_name: result.session_name,
                branch: result.branch,
                ai_session_id: result.ai_session_id,
            },
            started_at: now,
            updated_at: now,
        })
    }

    /// Marks the instance terminated and runs teardown (§4.1, §4.3).
    /// Idempotent on an already-terminal instance.
    #[instrument(skip(self, reason))]
    pub async fn terminate(
        &self,
        instance_id: &str,
        reason: Option<&str>,
    ) -> Result<(), WorkflowError> {
        let _guard = self.lock_for(instance_id).await;

        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| WorkflowError::InstanceNotFound(instance_id.to_string()))?;

        if instance.status.is_terminal() {
            return Ok(());
        }

        self.allocator
            .release(
                instance_id,
                instance.claude_pid,
                &instance.tmux_session,
                Path::new(&instance.worktree_path),
            )
            .await;

        self.store
            .update_instance_status(instance_id, InstanceStatus::Terminated)
            .await
            .map_err(|e| WorkflowError::CleanupFailed(e.to_string()))?;

        if let Some(reason) = reason {
            self.store
                .log_event(NewEvent {
                    instance_id: instance_id.to_string(),
                    tool_name: "terminate".to_string(),
                    success: true,
                    error_message: None,
                    is_status_updating: false,
                    status_change: None,
                    parameters: Some(format!(r#"{{"reason":{reason:?}}}"#)),
                    ..Default::default()
                })
                .await
                .map_err(|e| WorkflowError::CleanupFailed(e.to_string()))?;
        }

        self.max_reviews.lock().remove(instance_id);
        drop(_guard);
        self.forget_lock(instance_id);
        Ok(())
    }

    /// Returns derived runtime state, or `None` if the instance doesn't
    /// exist (§4.1).
    pub async fn get_state(&self, instance_id: &str) -> Result<Option<WorkflowState>, WorkflowError> {
        let Some(instance) = self.store.get_instance(instance_id).await? else {
            return Ok(None);
        };

        let relationships = self.store.get_relationships(instance_id).await?;
        let spawned: Vec<_> = relationships
            .iter()
            .filter(|r| r.parent_instance == instance_id && r.relationship_type == SPAWNED_REVIEW)
            .collect();
        let review_count = spawned.len() as i64;

        let mut current_review_instance_id = None;
        for rel in &spawned {
            if let Some(child) = self.store.get_instance(&rel.child_instance).await? {
                if !child.status.is_terminal() {
                    current_review_instance_id = Some(child.id);
                    break;
                }
            }
        }

        let max_reviews = self
            .max_reviews
            .lock()
            .get(instance_id)
            .copied()
            .unwrap_or(self.default_max_reviews);

        Ok(Some(WorkflowState {
            phase: Phase::from_status(instance.status),
            review_count,
            max_reviews,
            current_review_instance_id,
            last_activity: instance.last_activity,
        }))
    }

    /// Enforces the four review-gate invariants in order, then transitions
    /// the parent to `waiting_review` and derives the reservation id
    /// (§4.4). Does not itself create the `spawned_review` relationship
    /// row or spawn the review agent — that is a separate `execute` call
    /// plus `createRelationship`, per the preserved open question (§9).
    #[instrument(skip(self))]
    pub async fn request_review(
        &self,
        instance_id: &str,
        max_reviews: i64,
    ) -> Result<String, WorkflowError> {
        let _guard = self.lock_for(instance_id).await;

        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| WorkflowError::InstanceNotFound(instance_id.to_string()))?;

        if instance.status != InstanceStatus::Started {
            return Err(WorkflowError::InvalidState {
                id: instance_id.to_string(),
                current_status: instance.status.to_string(),
                requested_transition: "request_review".to_string(),
            });
        }

        let relationships = self.store.get_relationships(instance_id).await?;
        let spawned: Vec<_> = relationships
            .iter()
            .filter(|r| r.parent_instance == instance_id && r.relationship_type == SPAWNED_REVIEW)
            .collect();
        let review_count = spawned.len() as i64;

        if review_count >= max_reviews {
            return Err(WorkflowError::MaxReviewsExceeded {
                id: instance_id.to_string(),
                review_count,
                max_reviews,
            });
        }

        for rel in &spawned {
            if let Some(child) = self.store.get_instance(&rel.child_instance).await? {
                if !child.status.is_terminal() {
                    return Err(WorkflowError::ReviewInProgress(instance_id.to_string()));
                }
            }
        }

        self.store
            .update_instance_status(instance_id, InstanceStatus::WaitingReview)
            .await?;
        self.max_reviews.lock().insert(instance_id.to_string(), max_reviews);

        Ok(format!("review-{instance_id}-{}", review_count + 1))
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
    use crate::store::InstanceStatus;

    fn config(dir: &Path) -> ExecuteConfig {
        ExecuteConfig {
            base_branch: "main".to_string(),
            repo_path: dir.to_path_buf(),
            worktrees_root: dir.to_path_buf(),
            issue_number: Some(123),
            ai_command: "true".to_string(),
            tool_server_command: "true".to_string(),
            prompt: "do the thing".to_string(),
            system_prompt: "you are an agent".to_string(),
            max_reviews: 3,
            ..ExecuteConfig::default()
        }
    }

    async fn engine() -> (tempfile::TempDir, WorkflowEngine) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let allocator = Arc::new(Allocator::new(
            Arc::new(FakeWorktreeCapability::new()),
            Arc::new(FakeMultiplexerCapability::new()),
            Arc::new(FakeAiLauncherCapability::new()),
            Arc::new(FakeToolServerSpawner::new()),
            Arc::new(SystemClock),
        ));
        let engine = WorkflowEngine::new(store, allocator, Arc::new(SystemClock), DEFAULT_MAX_REVIEWS);
        (dir, engine)
    }

    #[tokio::test]
    async fn execute_happy_path_returns_started_descriptor() {
        let (dir, engine) = engine().await;
        let descriptor = engine.execute(config(dir.path())).await.unwrap();

        assert_eq!(descriptor.status, InstanceStatus::Started);
        assert!(descriptor.id.starts_with("work-123-"));
        assert!(descriptor.resources.branch.contains(&descriptor.id));

        let state = engine.get_state(&descriptor.id).await.unwrap().unwrap();
        assert_eq!(state.phase, Phase::Working);
        assert_eq!(state.max_reviews, 3);
        assert_eq!(state.review_count, 0);
    }

    #[tokio::test]
    async fn execute_rejects_empty_base_branch() {
        let (dir, engine) = engine().await;
        let mut cfg = config(dir.path());
        cfg.base_branch = String::new();
        let err = engine.execute(cfg).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn execute_allocation_failure_marks_terminated_and_propagates_capability_code() {
        let (dir, _unused) = engine().await;
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let worktree = Arc::new(FakeWorktreeCapability::new());
        let allocator = Arc::new(Allocator::new(
            worktree,
            Arc::new(FakeMultiplexerCapability::failing(
                crate::capabilities::multiplexer::MultiplexerError::CommandFailed("boom".into()),
            )),
            Arc::new(FakeAiLauncherCapability::new()),
            Arc::new(FakeToolServerSpawner::new()),
            Arc::new(SystemClock),
        ));
        let engine = WorkflowEngine::new(store.clone(), allocator, Arc::new(SystemClock), DEFAULT_MAX_REVIEWS);

        let err = engine.execute(config(dir.path())).await.unwrap_err();
        assert_eq!(err.code(), "MULTIPLEXER_COMMAND_FAILED");
    }

    #[tokio::test]
    async fn terminate_is_idempotent_on_terminal_instance() {
        let (dir, engine) = engine().await;
        let descriptor = engine.execute(config(dir.path())).await.unwrap();
        engine.terminate(&descriptor.id, None).await.unwrap();
        // Second terminate on an already-terminal row is a no-op success.
        engine.terminate(&descriptor.id, Some("double")).await.unwrap();

        let state = engine.get_state(&descriptor.id).await.unwrap().unwrap();
        assert_eq!(state.phase, Phase::Terminated);
    }

    #[tokio::test]
    async fn terminate_unknown_instance_fails() {
        let (_dir, engine) = engine().await;
        let err = engine.terminate("does-not-exist", None).await.unwrap_err();
        assert_eq!(err.code(), "WORKFLOW_INSTANCE_NOT_FOUND");
    }

    #[tokio::test]
    async fn get_state_returns_none_for_unknown_instance() {
        let (_dir, engine) = engine().await;
        assert!(engine.get_state("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn request_review_happy_path_transitions_and_derives_id() {
        let (dir, engine) = engine().await;
        let descriptor = engine.execute(config(dir.path())).await.unwrap();

        let review_id = engine.request_review(&descriptor.id, 3).await.unwrap();
        assert_eq!(review_id, format!("review-{}-1", descriptor.id));

        let state = engine.get_state(&descriptor.id).await.unwrap().unwrap();
        assert_eq!(state.phase, Phase::ReviewRequested);
    }

    #[tokio::test]
    async fn request_review_rejects_non_started_parent() {
        let (dir, engine) = engine().await;
        let descriptor = engine.execute(config(dir.path())).await.unwrap();
        engine.request_review(&descriptor.id, 3).await.unwrap();

        // Parent is now `waiting_review`; a second request is invalid.
        let err = engine.request_review(&descriptor.id, 3).await.unwrap_err();
        assert_eq!(err.code(), "WORKFLOW_INVALID_STATE");
    }

    #[tokio::test]
    async fn request_review_exceeds_max_reviews() {
        let (dir, engine) = engine().await;
        let descriptor = engine.execute(config(dir.path())).await.unwrap();

        for n in 1..=3 {
            let child_id = format!("{}-review-child-{n}", descriptor.id);
            engine
                .store
                .create_instance(crate::store::Instance {
                    id: child_id.clone(),
                    instance_type: InstanceType::Review,
                    status: InstanceStatus::Terminated,
                    worktree_path: String::new(),
                    branch_name: String::new(),
                    tmux_session: String::new(),
                    issue_number: None,
                    parent_instance_id: Some(descriptor.id.clone()),
                    base_branch: "main".to_string(),
                    agent_number: None,
                    system_prompt: String::new(),
                    prompt_used: String::new(),
                    prompt_context: String::new(),
                    claude_pid: None,
                    created_at: Utc::now(),
                    last_activity: Utc::now(),
                    terminated_at: Some(Utc::now()),
                })
                .await
                .unwrap();
            engine
                .store
                .create_relationship(&descriptor.id, &child_id, SPAWNED_REVIEW, n)
                .await
                .unwrap();
        }

        let err = engine.request_review(&descriptor.id, 3).await.unwrap_err();
        assert_eq!(err.code(), "WORKFLOW_MAX_REVIEWS_EXCEEDED");
    }

    #[tokio::test]
    async fn request_review_rejects_when_review_already_in_progress() {
        let (dir, engine) = engine().await;
        let descriptor = engine.execute(config(dir.path())).await.unwrap();

        let child_id = format!("{}-review-child-1", descriptor.id);
        engine
            .store
            .create_instance(crate::store::Instance {
                id: child_id.clone(),
                instance_type: InstanceType::Review,
                status: InstanceStatus::Started,
                worktree_path: String::new(),
                branch_name: String::new(),
                tmux_session: String::new(),
                issue_number: None,
                parent_instance_id: Some(descriptor.id.clone()),
                base_branch: "main".to_string(),
                agent_number: None,
                system_prompt: String::new(),
                prompt_used: String::new(),
                prompt_context: String::new(),
                claude_pid: None,
                created_at: Utc::now(),
                last_activity: Utc::now(),
                terminated_at: None,
            })
            .await
            .unwrap();
        engine
            .store
            .create_relationship(&descriptor.id, &child_id, SPAWNED_REVIEW, 1)
            .await
            .unwrap();

        let err = engine.request_review(&descriptor.id, 3).await.unwrap_err();
        assert_eq!(err.code(), "WORKFLOW_REVIEW_IN_PROGRESS");

        let state = engine.get_state(&descriptor.id).await.unwrap().unwrap();
        assert_eq!(state.current_review_instance_id.as_deref(), Some(child_id.as_str()));
    }
}
