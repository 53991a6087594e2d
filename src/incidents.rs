use crate::tracked::Diagnosis;
use rusqlite::{Connection, Result};
use std::path::Path;

/// Opens (or creates) the incident log SQLite database at the given path.
///
/// Creates the diagnoses table and index if they don't already exist.
pub fn open_or_create(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;

    // Enable WAL mode so `incidents` can read while a warden is writing.
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS diagnoses (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            pid         INTEGER NOT NULL,
            pgid        INTEGER NOT NULL,
            from_state  TEXT NOT NULL,
            to_state    TEXT NOT NULL,
            evidence    TEXT NOT NULL,
            created     TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_diagnoses_pid ON diagnoses(pid);",
    )?;

    Ok(conn)
}

/// Append one diagnosis. Returns the new row id.
pub fn insert_diagnosis(conn: &Connection, diagnosis: &Diagnosis) -> Result<i64> {
    conn.execute(
        "INSERT INTO diagnoses (pid, pgid, from_state, to_state, evidence, created)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            diagnosis.process_id.pid,
            diagnosis.process_id.pgid,
            diagnosis.from_state.as_str(),
            diagnosis.to_state.as_str(),
            diagnosis.evidence,
            diagnosis.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// A row from the diagnoses table.
#[derive(Debug)]
pub struct Incident {
    pub id: i64,
    pub pid: i32,
    pub pgid: i32,
    pub from_state: String,
    pub to_state: String,
    pub evidence: String,
    pub created: String,
}

/// The newest `limit` diagnoses, newest first.
pub fn list_diagnoses(conn: &Connection, limit: u32) -> Result<Vec<Incident>> {
    let mut stmt = conn.prepare(
        "SELECT id, pid, pgid, from_state, to_state, evidence, created
         FROM diagnoses ORDER BY id DESC LIMIT ?1",
    )?;
    let iter = stmt.query_map(rusqlite::params![limit], map_incident)?;
    let rows = iter.collect::<Result<Vec<_>>>()?;
    Ok(rows)
}

fn map_incident(row: &rusqlite::Row) -> Result<Incident> {
    Ok(Incident {
        id: row.get(0)?,
        pid: row.get(1)?,
        pgid: row.get(2)?,
        from_state: row.get(3)?,
        to_state: row.get(4)?,
        evidence: row.get(5)?,
        created: row.get(6)?,
    })
}
