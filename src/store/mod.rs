//! Persistence store: an embedded single-file relational database
//! (SQLite via `rusqlite`) holding `instance`, `event`, `relationship`,
//! `github_issue`, and `user_config` tables. Exposes a small transactional
//! API; every mutating method is transactional with respect to any event
//! it also writes (§4.2).
//!
//! `rusqlite::Connection` is synchronous, so every call that touches it
//! runs inside `spawn_blocking`, guarded by a `parking_lot::Mutex` —
//! mirroring the "dedicated connection/mutex" concurrency note in §5.

mod config_kv;
mod error;
mod event;
mod github_issue;
mod instance;
mod models;
mod relationship;
mod schema;

pub use error::StoreError;
pub use models::{
    Event, GitHubIssue, Instance, InstanceFilter, InstancePatch, InstanceStatus, InstanceType,
    NewEvent, OrderBy, OrderDirection, Relationship,
};

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::instrument;

pub struct Store {
    conn: Arc<Mutex<Connection>>,
    connected: AtomicBool,
}

impl Store {
    /// Opens (creating if absent) the database file at `path` and applies
    /// the embedded schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            let conn = Connection::open(&path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.execute_batch(schema::SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::OperationFailed(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            connected: AtomicBool::new(true),
        })
    }

    /// In-memory store, for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection, StoreError> {
            let conn = Connection::open_in_memory()?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.execute_batch(schema::SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::OperationFailed(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            connected: AtomicBool::new(true),
        })
    }

    /// Runs a synchronous closure against the guarded connection on a
    /// blocking thread.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::OperationFailed(e.to_string()))?
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Idempotent: a second `connect()` on an already-connected store is a
    /// no-op success.
    pub async fn connect(&self) -> Result<(), StoreError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Idempotent: a second `disconnect()` is a no-op success.
    pub async fn disconnect(&self) -> Result<(), StoreError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Fails unless cloud replication is explicitly enabled; this
    /// deployment never enables it, so `sync()` always fails.
    pub async fn sync(&self) -> Result<(), StoreError> {
        Err(StoreError::OperationFailed(
            "cloud replication is not enabled".to_string(),
        ))
    }

    #[instrument(skip(self))]
    pub async fn vacuum(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch("VACUUM")?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn backup(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let dest = path.as_ref().to_path_buf();
        self.with_conn(move |conn| {
            rusqlite::backup::Backup::new(conn, &mut Connection::open(&dest)?)
                .map_err(|e| StoreError::OperationFailed(e.to_string()))?
                .run_to_completion(5, std::time::Duration::from_millis(250), None)
                .map_err(|e| StoreError::OperationFailed(e.to_string()))?;
            Ok(())
        })
        .await
    }

    // Instance operations

    pub async fn create_instance(&self, row: Instance) -> Result<(), StoreError> {
        self.with_conn(move |conn| instance::create(conn, &row)).await
    }

    pub async fn get_instance(&self, id: &str) -> Result<Option<Instance>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| instance::get(conn, &id)).await
    }

    pub async fn update_instance(&self, id: &str, patch: InstancePatch) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| instance::update(conn, &id, &patch))
            .await
    }

    pub async fn update_instance_status(
        &self,
        id: &str,
        new_status: InstanceStatus,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| instance::update_status(conn, &id, new_status))
            .await
    }

    pub async fn delete_instance(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| instance::delete(conn, &id)).await
    }

    pub async fn list_instances(&self, filter: InstanceFilter) -> Result<Vec<Instance>, StoreError> {
        self.with_conn(move |conn| instance::list(conn, &filter)).await
    }

    // Event operations

    pub async fn log_event(&self, event: NewEvent) -> Result<i64, StoreError> {
        self.with_conn(move |conn| event::log(conn, &event)).await
    }

    pub async fn get_events(
        &self,
        instance_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<Event>, StoreError> {
        let instance_id = instance_id.to_string();
        self.with_conn(move |conn| event::get_for_instance(conn, &instance_id, limit))
            .await
    }

    pub async fn get_recent_events(
        &self,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<Event>, StoreError> {
        self.with_conn(move |conn| event::get_recent(conn, since)).await
    }

    // Relationship operations

    pub async fn create_relationship(
        &self,
        parent_instance: &str,
        child_instance: &str,
        relationship_type: &str,
        review_iteration: i64,
    ) -> Result<i64, StoreError> {
        let parent_instance = parent_instance.to_string();
        let child_instance = child_instance.to_string();
        let relationship_type = relationship_type.to_string();
        self.with_conn(move |conn| {
            relationship::create(
                conn,
                &parent_instance,
                &child_instance,
                &relationship_type,
                review_iteration,
            )
        })
        .await
    }

    pub async fn get_relationships(&self, instance_id: &str) -> Result<Vec<Relationship>, StoreError> {
        let instance_id = instance_id.to_string();
        self.with_conn(move |conn| relationship::get_for_instance(conn, &instance_id))
            .await
    }

    pub async fn update_relationship(
        &self,
        id: i64,
        review_iteration: i64,
    ) -> Result<(), StoreError> {
        self.with_conn(move |conn| relationship::update(conn, id, review_iteration))
            .await
    }

    // GitHub issue cache

    pub async fn upsert_github_issue(&self, issue: GitHubIssue) -> Result<(), StoreError> {
        self.with_conn(move |conn| github_issue::upsert(conn, &issue))
            .await
    }

    pub async fn get_github_issue(&self, number: i64) -> Result<Option<GitHubIssue>, StoreError> {
        self.with_conn(move |conn| github_issue::get(conn, number))
            .await
    }

    pub async fn sync_github_issues(&self, issues: Vec<GitHubIssue>) -> Result<(), StoreError> {
        self.with_conn(move |conn| github_issue::sync(conn, &issues))
            .await
    }

    // Config key/value

    pub async fn set_config(
        &self,
        key: &str,
        value: &str,
        encrypted: bool,
    ) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| config_kv::set(conn, &key, &value, encrypted))
            .await
    }

    pub async fn get_config(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| config_kv::get(conn, &key)).await
    }

    pub async fn delete_config(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| config_kv::delete(conn, &key))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use chrono::Utc;

    fn sample_instance(id: &str) -> Instance {
        let now = Utc::now();
        Instance {
            id: id.to_string(),
            instance_type: InstanceType::Coding,
            status: InstanceStatus::Started,
            worktree_path: String::new(),
            branch_name: String::new(),
            tmux_session: String::new(),
            issue_number: Some(123),
            parent_instance_id: None,
            base_branch: "main".to_string(),
            agent_number: None,
            system_prompt: String::new(),
            prompt_used: String::new(),
            prompt_context: String::new(),
            claude_pid: None,
            created_at: now,
            last_activity: now,
            terminated_at: None,
        }
    }

    #[tokio::test]
    async fn duplicate_create_instance_fails() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_instance(sample_instance("work-123-a1"))
            .await
            .unwrap();
        let err = store
            .create_instance(sample_instance("work-123-a1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DATABASE_INSERT_FAILED");
    }

    #[tokio::test]
    async fn status_update_stamps_terminated_at() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_instance(sample_instance("work-123-a1"))
            .await
            .unwrap();
        store
            .update_instance_status("work-123-a1", InstanceStatus::PrMerged)
            .await
            .unwrap();
        let row = store.get_instance("work-123-a1").await.unwrap().unwrap();
        assert_eq!(row.status, InstanceStatus::PrMerged);
        assert!(row.terminated_at.is_some());

        let events = store.get_events("work-123-a1", None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_status_updating);
        assert_eq!(events[0].status_change.as_deref(), Some("pr_merged"));
    }

    #[tokio::test]
    async fn config_roundtrip_and_delete_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        store.set_config("k", "v1", false).await.unwrap();
        assert_eq!(store.get_config("k").await.unwrap(), Some("v1".to_string()));
        store.set_config("k", "v2", false).await.unwrap();
        assert_eq!(store.get_config("k").await.unwrap(), Some("v2".to_string()));
        store.delete_config("missing").await.unwrap();
        assert_eq!(store.get_config("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn connect_disconnect_are_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        store.connect().await.unwrap();
        store.connect().await.unwrap();
        assert!(store.is_connected());
        store.disconnect().await.unwrap();
        store.disconnect().await.unwrap();
        assert!(!store.is_connected());
    }

    #[tokio::test]
    async fn list_instances_respects_limit_and_offset() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_instance(sample_instance("work-1"))
            .await
            .unwrap();
        store
            .create_instance(sample_instance("work-2"))
            .await
            .unwrap();

        let empty = store
            .list_instances(InstanceFilter {
                limit: Some(0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(empty.is_empty());

        let offset_past_end = store
            .list_instances(InstanceFilter {
                offset: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(offset_past_end.is_empty());
    }

    #[tokio::test]
    async fn events_and_relationships_for_unknown_instance_are_empty() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store.get_events("nope", None).await.unwrap().is_empty());
        assert!(store.get_relationships("nope").await.unwrap().is_empty());
    }
}
