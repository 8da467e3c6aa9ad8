use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::error::StoreError;
use super::models::{Instance, InstanceFilter, InstancePatch, InstanceStatus, InstanceType};

fn row_to_instance(row: &Row<'_>) -> rusqlite::Result<Instance> {
    let instance_type: String = row.get("instance_type")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let last_activity: String = row.get("last_activity")?;
    let terminated_at: Option<String> = row.get("terminated_at")?;

    Ok(Instance {
        id: row.get("id")?,
        instance_type: instance_type.parse().unwrap_or(InstanceType::Coding),
        status: status.parse().unwrap_or(InstanceStatus::Started),
        worktree_path: row.get("worktree_path")?,
        branch_name: row.get("branch_name")?,
        tmux_session: row.get("tmux_session")?,
        issue_number: row.get("issue_number")?,
        parent_instance_id: row.get("parent_instance_id")?,
        base_branch: row.get("base_branch")?,
        agent_number: row.get("agent_number")?,
        system_prompt: row.get("system_prompt")?,
        prompt_used: row.get("prompt_used")?,
        prompt_context: row.get("prompt_context")?,
        claude_pid: row.get("claude_pid")?,
        created_at: parse_ts(&created_at),
        last_activity: parse_ts(&last_activity),
        terminated_at: terminated_at.as_deref().map(parse_ts),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub fn create(conn: &Connection, row: &Instance) -> Result<(), StoreError> {
    let result = conn.execute(
        "INSERT INTO instance (
            id, instance_type, status, worktree_path, branch_name, tmux_session,
            issue_number, parent_instance_id, base_branch, agent_number,
            system_prompt, prompt_used, prompt_context, claude_pid,
            created_at, last_activity, terminated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            row.id,
            row.instance_type.to_string(),
            row.status.to_string(),
            row.worktree_path,
            row.branch_name,
            row.tmux_session,
            row.issue_number,
            row.parent_instance_id,
            row.base_branch,
            row.agent_number,
            row.system_prompt,
            row.prompt_used,
            row.prompt_context,
            row.claude_pid,
            row.created_at.to_rfc3339(),
            row.last_activity.to_rfc3339(),
            row.terminated_at.map(|t| t.to_rfc3339()),
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(e) => Err(StoreError::InsertFailed(e.to_string())),
    }
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<Instance>, StoreError> {
    conn.query_row("SELECT * FROM instance WHERE id = ?1", params![id], row_to_instance)
        .optional()
        .map_err(StoreError::from)
}

pub fn update(conn: &Connection, id: &str, patch: &InstancePatch) -> Result<(), StoreError> {
    let existing = get(conn, id)?.ok_or_else(|| {
        StoreError::UpdateFailed(format!("instance {id} does not exist"))
    })?;

    let worktree_path = patch.worktree_path.clone().unwrap_or(existing.worktree_path);
    let branch_name = patch.branch_name.clone().unwrap_or(existing.branch_name);
    let tmux_session = patch.tmux_session.clone().unwrap_or(existing.tmux_session);
    let claude_pid = patch.claude_pid.or(existing.claude_pid);
    let system_prompt = patch.system_prompt.clone().unwrap_or(existing.system_prompt);
    let prompt_used = patch.prompt_used.clone().unwrap_or(existing.prompt_used);
    let prompt_context = patch.prompt_context.clone().unwrap_or(existing.prompt_context);
    let now = Utc::now();

    let affected = conn
        .execute(
            "UPDATE instance SET
                worktree_path = ?1, branch_name = ?2, tmux_session = ?3,
                claude_pid = ?4, system_prompt = ?5, prompt_used = ?6,
                prompt_context = ?7, last_activity = ?8
             WHERE id = ?9",
            params![
                worktree_path,
                branch_name,
                tmux_session,
                claude_pid,
                system_prompt,
                prompt_used,
                prompt_context,
                now.to_rfc3339(),
                id,
            ],
        )
        .map_err(|e| StoreError::UpdateFailed(e.to_string()))?;

    if affected == 0 {
        return Err(StoreError::UpdateFailed(format!("instance {id} does not exist")));
    }
    Ok(())
}

/// Single transaction: patch status, conditionally stamp `terminated_at`
/// for terminal statuses, and write the paired status-change event (§4.2,
/// §4.5) — either both land or neither does.
pub fn update_status(
    conn: &Connection,
    id: &str,
    new_status: InstanceStatus,
) -> Result<(), StoreError> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| StoreError::UpdateFailed(e.to_string()))?;

    let now = Utc::now();
    let terminated_at = if new_status.is_terminal() {
        Some(now.to_rfc3339())
    } else {
        None
    };

    let affected = tx
        .execute(
            "UPDATE instance SET status = ?1, last_activity = ?2, terminated_at = COALESCE(?3, terminated_at)
             WHERE id = ?4",
            params![new_status.to_string(), now.to_rfc3339(), terminated_at, id],
        )
        .map_err(|e| StoreError::UpdateFailed(e.to_string()))?;

    if affected == 0 {
        return Err(StoreError::UpdateFailed(format!("instance {id} does not exist")));
    }

    tx.execute(
        "INSERT INTO event (
            instance_id, tool_name, timestamp, success, error_message,
            is_status_updating, status_change, parameters, result
        ) VALUES (?1, 'update_instance_status', ?2, 1, NULL, 1, ?3, NULL, NULL)",
        params![id, now.to_rfc3339(), new_status.to_string()],
    )
    .map_err(|e| StoreError::UpdateFailed(e.to_string()))?;

    tx.commit().map_err(|e| StoreError::UpdateFailed(e.to_string()))?;
    Ok(())
}

pub fn delete(conn: &Connection, id: &str) -> Result<(), StoreError> {
    let affected = conn
        .execute("DELETE FROM instance WHERE id = ?1", params![id])
        .map_err(|e| StoreError::DeleteFailed(e.to_string()))?;
    if affected == 0 {
        return Err(StoreError::DeleteFailed(format!("instance {id} does not exist")));
    }
    Ok(())
}

pub fn list(conn: &Connection, filter: &InstanceFilter) -> Result<Vec<Instance>, StoreError> {
    if filter.limit == Some(0) {
        return Ok(Vec::new());
    }

    let mut sql = String::from("SELECT * FROM instance WHERE 1=1");
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if !filter.types.is_empty() {
        let placeholders = filter
            .types
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" AND instance_type IN ({placeholders})"));
        for t in &filter.types {
            args.push(Box::new(t.to_string()));
        }
    }

    if !filter.statuses.is_empty() {
        let placeholders = filter
            .statuses
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" AND status IN ({placeholders})"));
        for s in &filter.statuses {
            args.push(Box::new(s.to_string()));
        }
    }

    if let Some(issue) = filter.issue_number {
        sql.push_str(" AND issue_number = ?");
        args.push(Box::new(issue));
    }

    if let Some(ref parent) = filter.parent_instance {
        sql.push_str(" AND parent_instance_id = ?");
        args.push(Box::new(parent.clone()));
    }

    sql.push_str(&format!(
        " ORDER BY {} {}",
        filter.order_by.column(),
        filter.order_direction.sql()
    ));

    // SQLite's grammar requires LIMIT whenever OFFSET is present; -1 means
    // "no limit" so an offset-only filter still parses.
    if filter.limit.is_some() || filter.offset.is_some() {
        sql.push_str(&format!(" LIMIT {}", filter.limit.unwrap_or(-1)));
    }
    if let Some(offset) = filter.offset {
        sql.push_str(&format!(" OFFSET {offset}"));
    }

    let mut stmt = conn.prepare(&sql).map_err(StoreError::from)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), row_to_instance)
        .map_err(StoreError::from)?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(StoreError::from)?);
    }
    Ok(out)
}
