use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::error::StoreError;
use super::models::Relationship;

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_relationship(row: &Row<'_>) -> rusqlite::Result<Relationship> {
    let created_at: String = row.get("created_at")?;
    Ok(Relationship {
        id: row.get("id")?,
        parent_instance: row.get("parent_instance")?,
        child_instance: row.get("child_instance")?,
        relationship_type: row.get("relationship_type")?,
        created_at: parse_ts(&created_at),
        review_iteration: row.get("review_iteration")?,
    })
}

pub fn create(
    conn: &Connection,
    parent_instance: &str,
    child_instance: &str,
    relationship_type: &str,
    review_iteration: i64,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO relationship (parent_instance, child_instance, relationship_type, created_at, review_iteration)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            parent_instance,
            child_instance,
            relationship_type,
            Utc::now().to_rfc3339(),
            review_iteration,
        ],
    )
    .map_err(|e| StoreError::InsertFailed(e.to_string()))?;

    Ok(conn.last_insert_rowid())
}

/// Returns edges where the instance is either parent or child (§4.2),
/// ordered `created_at DESC`.
pub fn get_for_instance(conn: &Connection, instance_id: &str) -> Result<Vec<Relationship>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT * FROM relationship WHERE parent_instance = ?1 OR child_instance = ?1
             ORDER BY created_at DESC, id DESC",
        )
        .map_err(StoreError::from)?;
    let rows = stmt
        .query_map(params![instance_id], row_to_relationship)
        .map_err(StoreError::from)?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(StoreError::from)?);
    }
    Ok(out)
}

pub fn update(conn: &Connection, id: i64, review_iteration: i64) -> Result<(), StoreError> {
    let affected = conn
        .execute(
            "UPDATE relationship SET review_iteration = ?1 WHERE id = ?2",
            params![review_iteration, id],
        )
        .map_err(|e| StoreError::UpdateFailed(e.to_string()))?;
    if affected == 0 {
        return Err(StoreError::UpdateFailed(format!("relationship {id} does not exist")));
    }
    Ok(())
}
