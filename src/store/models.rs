//! Row types and wire enums for the persistence store.
//!
//! Enum columns are stored as `TEXT`; the store itself does not enforce
//! them (§6: "string values are validated at the Rust type layer via
//! `FromStr`/`Display`, but the store stores whatever text is given").
//! These `FromStr`/`Display` impls are the application-layer validation
//! point, deliberately not wired into the SQL layer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceType {
    Coding,
    Review,
    Planning,
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceType::Coding => "coding",
            InstanceType::Review => "review",
            InstanceType::Planning => "planning",
        };
        f.write_str(s)
    }
}

impl FromStr for InstanceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coding" => Ok(InstanceType::Coding),
            "review" => Ok(InstanceType::Review),
            "planning" => Ok(InstanceType::Planning),
            other => Err(format!("unknown instance type {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Started,
    WaitingReview,
    PrCreated,
    PrClosed,
    PrMerged,
    Terminated,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Terminated | InstanceStatus::PrClosed | InstanceStatus::PrMerged
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Started => "started",
            InstanceStatus::WaitingReview => "waiting_review",
            InstanceStatus::PrCreated => "pr_created",
            InstanceStatus::PrClosed => "pr_closed",
            InstanceStatus::PrMerged => "pr_merged",
            InstanceStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(InstanceStatus::Started),
            "waiting_review" => Ok(InstanceStatus::WaitingReview),
            "pr_created" => Ok(InstanceStatus::PrCreated),
            "pr_closed" => Ok(InstanceStatus::PrClosed),
            "pr_merged" => Ok(InstanceStatus::PrMerged),
            "terminated" => Ok(InstanceStatus::Terminated),
            other => Err(format!("unknown instance status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub instance_type: InstanceType,
    pub status: InstanceStatus,
    pub worktree_path: String,
    pub branch_name: String,
    pub tmux_session: String,
    pub issue_number: Option<i64>,
    pub parent_instance_id: Option<String>,
    pub base_branch: String,
    pub agent_number: Option<i64>,
    pub system_prompt: String,
    pub prompt_used: String,
    pub prompt_context: String,
    pub claude_pid: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub instance_id: String,
    pub tool_name: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
    pub is_status_updating: bool,
    pub status_change: Option<String>,
    pub parameters: Option<String>,
    pub result: Option<String>,
}

/// Fields a caller supplies when logging a new event; `id` and `timestamp`
/// are assigned by the store.
#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub instance_id: String,
    pub tool_name: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub success: bool,
    pub error_message: Option<String>,
    pub is_status_updating: bool,
    pub status_change: Option<String>,
    pub parameters: Option<String>,
    pub result: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: i64,
    pub parent_instance: String,
    pub child_instance: String,
    pub relationship_type: String,
    pub created_at: DateTime<Utc>,
    pub review_iteration: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubIssue {
    pub number: i64,
    pub title: String,
    pub body: String,
    pub state: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct InstancePatch {
    pub worktree_path: Option<String>,
    pub branch_name: Option<String>,
    pub tmux_session: Option<String>,
    pub claude_pid: Option<i64>,
    pub system_prompt: Option<String>,
    pub prompt_used: Option<String>,
    pub prompt_context: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub types: Vec<InstanceType>,
    pub statuses: Vec<InstanceStatus>,
    pub issue_number: Option<i64>,
    pub parent_instance: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub order_by: OrderBy,
    pub order_direction: OrderDirection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderBy {
    #[default]
    CreatedAt,
    LastActivity,
}

impl OrderBy {
    pub fn column(self) -> &'static str {
        match self {
            OrderBy::CreatedAt => "created_at",
            OrderBy::LastActivity => "last_activity",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    #[default]
    Desc,
}

impl OrderDirection {
    pub fn sql(self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}
