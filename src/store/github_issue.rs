use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::error::StoreError;
use super::models::GitHubIssue;

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_issue(row: &Row<'_>) -> rusqlite::Result<GitHubIssue> {
    let updated_at: String = row.get("updated_at")?;
    Ok(GitHubIssue {
        number: row.get("number")?,
        title: row.get("title")?,
        body: row.get("body")?,
        state: row.get("state")?,
        updated_at: parse_ts(&updated_at),
    })
}

pub fn upsert(conn: &Connection, issue: &GitHubIssue) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO github_issue (number, title, body, state, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(number) DO UPDATE SET
            title = excluded.title, body = excluded.body,
            state = excluded.state, updated_at = excluded.updated_at",
        params![
            issue.number,
            issue.title,
            issue.body,
            issue.state,
            issue.updated_at.to_rfc3339(),
        ],
    )
    .map_err(|e| StoreError::OperationFailed(e.to_string()))?;
    Ok(())
}

pub fn get(conn: &Connection, number: i64) -> Result<Option<GitHubIssue>, StoreError> {
    conn.query_row(
        "SELECT * FROM github_issue WHERE number = ?1",
        params![number],
        row_to_issue,
    )
    .optional()
    .map_err(StoreError::from)
}

pub fn sync(conn: &Connection, issues: &[GitHubIssue]) -> Result<(), StoreError> {
    for issue in issues {
        upsert(conn, issue)?;
    }
    Ok(())
}
