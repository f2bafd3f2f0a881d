//! Optional SQLite mirror of OpenCode's `message`/`part` tables
//! (`opencode.db`, one level above the storage root). Only consulted when
//! the file-backed `session`/`message`/`part` tree comes up empty — the
//! file tree is the primary storage layout (spec §4.3.4).

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde_json::Value;

fn db_candidates(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Ok(env) = std::env::var("OPENCODE_DB_PATH") {
        if !env.trim().is_empty() {
            out.push(PathBuf::from(env));
        }
    }
    if let Some(parent) = root.parent() {
        out.push(parent.join("opencode.db"));
    }
    out.push(root.join("opencode.db"));
    out
}

fn resolve_db_path(root: &Path) -> Option<PathBuf> {
    db_candidates(root).into_iter().find(|p| p.is_file())
}

/// `SELECT data FROM message WHERE session_id = ? ORDER BY time_created,
/// time_updated, id`, decoded as raw JSON blobs (mirrors the file tree's
/// per-message JSON shape).
pub fn read_messages(root: &Path, session_id: &str) -> Vec<Value> {
    let Some(db_path) = resolve_db_path(root) else {
        return Vec::new();
    };
    let Ok(conn) = Connection::open_with_flags(
        &db_path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    ) else {
        return Vec::new();
    };
    let _ = conn.busy_timeout(std::time::Duration::from_millis(200));

    let Ok(mut stmt) = conn.prepare(
        "SELECT id, time_created, time_updated, data FROM message \
         WHERE session_id = ?1 ORDER BY time_created ASC, time_updated ASC, id ASC",
    ) else {
        return Vec::new();
    };
    let rows = stmt.query_map([session_id], |row| {
        let id: String = row.get(0)?;
        let created: Option<i64> = row.get(1)?;
        let updated: Option<i64> = row.get(2)?;
        let data: String = row.get(3)?;
        Ok((id, created, updated, data))
    });
    let Ok(rows) = rows else { return Vec::new() };

    rows.flatten()
        .map(|(id, created, updated, data)| {
            let mut payload: Value = serde_json::from_str(&data).unwrap_or_default();
            if !payload.is_object() {
                payload = serde_json::json!({});
            }
            let obj = payload.as_object_mut().unwrap();
            obj.entry("id").or_insert(Value::String(id));
            obj.entry("sessionID")
                .or_insert(Value::String(session_id.to_string()));
            let time = obj.entry("time").or_insert_with(|| serde_json::json!({}));
            if let Some(time_obj) = time.as_object_mut() {
                if time_obj.get("created").is_none() {
                    if let Some(c) = created {
                        time_obj.insert("created".to_string(), Value::from(c));
                    }
                }
                if time_obj.get("updated").is_none() {
                    if let Some(u) = updated {
                        time_obj.insert("updated".to_string(), Value::from(u));
                    }
                }
            }
            payload
        })
        .collect()
}

/// `SELECT data FROM part WHERE message_id = ? ORDER BY time_created,
/// time_updated, id`.
pub fn read_parts(root: &Path, message_id: &str) -> Vec<Value> {
    let Some(db_path) = resolve_db_path(root) else {
        return Vec::new();
    };
    let Ok(conn) = Connection::open_with_flags(
        &db_path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    ) else {
        return Vec::new();
    };
    let _ = conn.busy_timeout(std::time::Duration::from_millis(200));

    let Ok(mut stmt) = conn.prepare(
        "SELECT id, data FROM part \
         WHERE message_id = ?1 ORDER BY time_created ASC, time_updated ASC, id ASC",
    ) else {
        return Vec::new();
    };
    let rows = stmt.query_map([message_id], |row| {
        let id: String = row.get(0)?;
        let data: String = row.get(1)?;
        Ok((id, data))
    });
    let Ok(rows) = rows else { return Vec::new() };

    rows.flatten()
        .map(|(id, data)| {
            let mut payload: Value = serde_json::from_str(&data).unwrap_or_default();
            if !payload.is_object() {
                payload = serde_json::json!({});
            }
            let obj = payload.as_object_mut().unwrap();
            obj.entry("id").or_insert(Value::String(id));
            obj.entry("messageID")
                .or_insert(Value::String(message_id.to_string()));
            payload
        })
        .collect()
}
