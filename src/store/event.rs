use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::error::StoreError;
use super::models::{Event, NewEvent};

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let timestamp: String = row.get("timestamp")?;
    let success: i64 = row.get("success")?;
    let is_status_updating: i64 = row.get("is_status_updating")?;

    Ok(Event {
        id: row.get("id")?,
        instance_id: row.get("instance_id")?,
        tool_name: row.get("tool_name")?,
        timestamp: parse_ts(&timestamp),
        success: success != 0,
        error_message: row.get("error_message")?,
        is_status_updating: is_status_updating != 0,
        status_change: row.get("status_change")?,
        parameters: row.get("parameters")?,
        result: row.get("result")?,
    })
}

pub fn log(conn: &Connection, event: &NewEvent) -> Result<i64, StoreError> {
    let timestamp = event.timestamp.unwrap_or_else(Utc::now);
    conn.execute(
        "INSERT INTO event (
            instance_id, tool_name, timestamp, success, error_message,
            is_status_updating, status_change, parameters, result
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            event.instance_id,
            event.tool_name,
            timestamp.to_rfc3339(),
            event.success as i64,
            event.error_message,
            event.is_status_updating as i64,
            event.status_change,
            event.parameters,
            event.result,
        ],
    )
    .map_err(|e| StoreError::InsertFailed(e.to_string()))?;

    Ok(conn.last_insert_rowid())
}

pub fn get_for_instance(
    conn: &Connection,
    instance_id: &str,
    limit: Option<i64>,
) -> Result<Vec<Event>, StoreError> {
    let sql = match limit {
        Some(limit) => format!(
            "SELECT * FROM event WHERE instance_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT {limit}"
        ),
        None => "SELECT * FROM event WHERE instance_id = ?1 ORDER BY timestamp DESC, id DESC"
            .to_string(),
    };

    let mut stmt = conn.prepare(&sql).map_err(StoreError::from)?;
    let rows = stmt
        .query_map(params![instance_id], row_to_event)
        .map_err(StoreError::from)?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(StoreError::from)?);
    }
    Ok(out)
}

pub fn get_recent(conn: &Connection, since: DateTime<Utc>) -> Result<Vec<Event>, StoreError> {
    let mut stmt = conn
        .prepare("SELECT * FROM event WHERE timestamp >= ?1 ORDER BY timestamp DESC, id DESC")
        .map_err(StoreError::from)?;
    let rows = stmt
        .query_map(params![since.to_rfc3339()], row_to_event)
        .map_err(StoreError::from)?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(StoreError::from)?);
    }
    Ok(out)
}
