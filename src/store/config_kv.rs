use rusqlite::{params, Connection, OptionalExtension};

use super::error::StoreError;

pub fn set(conn: &Connection, key: &str, value: &str, encrypted: bool) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO user_config (key, value, encrypted) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, encrypted = excluded.encrypted",
        params![key, value, encrypted as i64],
    )
    .map_err(|e| StoreError::OperationFailed(e.to_string()))?;
    Ok(())
}

pub fn get(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    conn.query_row(
        "SELECT value FROM user_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
    .map_err(StoreError::from)
}

/// No-op success when the key does not exist (§4.2).
pub fn delete(conn: &Connection, key: &str) -> Result<(), StoreError> {
    conn.execute("DELETE FROM user_config WHERE key = ?1", params![key])
        .map_err(|e| StoreError::DeleteFailed(e.to_string()))?;
    Ok(())
}
