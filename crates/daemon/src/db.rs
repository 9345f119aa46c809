use common::{Instance, InstanceMeta, Port, PortBinding};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result, Row, Transaction, TransactionBehavior};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// Reserved state lives only in `port_bindings.released_at`; `port_status`
// derives the per-port flag from it. The triggers keep a port from joining
// two active bindings and keep a release from ever being rewritten.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    port_number INTEGER NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    meta TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS port_bindings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id TEXT NOT NULL REFERENCES instances(id),
    start_port INTEGER NOT NULL,
    end_port INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    released_at TEXT,
    CHECK (end_port >= start_port)
);

CREATE TABLE IF NOT EXISTS binding_ports (
    binding_id INTEGER NOT NULL REFERENCES port_bindings(id),
    port_id INTEGER NOT NULL REFERENCES ports(id),
    PRIMARY KEY (binding_id, port_id)
);

CREATE INDEX IF NOT EXISTS binding_ports_port ON binding_ports(port_id);
CREATE INDEX IF NOT EXISTS port_bindings_instance ON port_bindings(instance_id);

CREATE VIEW IF NOT EXISTS port_status AS
SELECT p.id, p.port_number,
       EXISTS (
           SELECT 1 FROM binding_ports bp
           JOIN port_bindings b ON b.id = bp.binding_id
           WHERE bp.port_id = p.id AND b.released_at IS NULL
       ) AS is_reserved
FROM ports p;

CREATE TRIGGER IF NOT EXISTS binding_ports_single_active
BEFORE INSERT ON binding_ports
WHEN EXISTS (
    SELECT 1 FROM binding_ports bp
    JOIN port_bindings b ON b.id = bp.binding_id
    WHERE bp.port_id = NEW.port_id AND b.released_at IS NULL
)
BEGIN
    SELECT RAISE(ABORT, 'port already has an active binding');
END;

CREATE TRIGGER IF NOT EXISTS port_bindings_release_once
BEFORE UPDATE OF released_at ON port_bindings
WHEN OLD.released_at IS NOT NULL
BEGIN
    SELECT RAISE(ABORT, 'binding already released');
END;
"#;

pub(crate) const PORT_COLUMNS: &str = "id, port_number, is_reserved";
pub(crate) const BINDING_COLUMNS: &str =
    "id, instance_id, start_port, end_port, created_at, released_at";

/// Open (or create) the database at the given path, creating the directory if needed.
pub fn init_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok();
    }

    prepare(Connection::open(path)?, true)
}

/// Open an in-memory database (for tests).
pub fn open_in_memory() -> Result<Connection> {
    prepare(Connection::open_in_memory()?, false)
}

fn prepare(conn: Connection, wal: bool) -> Result<Connection> {
    // Competing writers queue on the lock instead of failing with SQLITE_BUSY.
    conn.busy_timeout(Duration::from_secs(5))?;
    if wal {
        // Readers proceed while an allocation holds the write lock.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    }
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Get the default database path (~/.portmanager/gatekeeper.db)
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".portmanager")
        .join("gatekeeper.db")
}

/// Start a transaction that takes the write lock up front.
///
/// Every read-then-write sequence goes through here so that two callers can
/// never both see the same ports as free.
pub fn begin_write(conn: &mut Connection) -> Result<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

fn parse_timestamp(idx: usize, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn port_from_row(row: &Row<'_>) -> Result<Port> {
    Ok(Port {
        id: row.get(0)?,
        port_number: row.get(1)?,
        is_reserved: row.get(2)?,
    })
}

pub(crate) fn instance_from_row(row: &Row<'_>) -> Result<Instance> {
    let meta_json: String = row.get(2)?;
    let created_at: String = row.get(3)?;

    let meta: InstanceMeta = serde_json::from_str(&meta_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    Ok(Instance {
        id: row.get(0)?,
        name: row.get(1)?,
        meta,
        created_at: parse_timestamp(3, &created_at)?,
    })
}

pub(crate) fn binding_from_row(row: &Row<'_>) -> Result<PortBinding> {
    let created_at: String = row.get(4)?;
    let released_at: Option<String> = row.get(5)?;

    Ok(PortBinding {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        start_port: row.get(2)?,
        end_port: row.get(3)?,
        created_at: parse_timestamp(4, &created_at)?,
        released_at: released_at
            .map(|value| parse_timestamp(5, &value))
            .transpose()?,
    })
}

pub fn get_binding(conn: &Connection, id: i64) -> Result<Option<PortBinding>> {
    conn.query_row(
        &format!("SELECT {} FROM port_bindings WHERE id = ?1", BINDING_COLUMNS),
        params![id],
        binding_from_row,
    )
    .optional()
}

pub fn get_port(conn: &Connection, port_number: u16) -> Result<Option<Port>> {
    conn.query_row(
        &format!("SELECT {} FROM port_status WHERE port_number = ?1", PORT_COLUMNS),
        params![port_number],
        port_from_row,
    )
    .optional()
}

/// Insert a binding and link it to the given port rows.
///
/// `port_ids` must be the rows for `start_port..=end_port`; the trigger on
/// `binding_ports` aborts the statement if any of them is already bound.
pub(crate) fn insert_binding(
    tx: &Transaction<'_>,
    instance_id: &str,
    start_port: u16,
    end_port: u16,
    port_ids: &[i64],
) -> Result<PortBinding> {
    debug_assert_eq!(port_ids.len(), usize::from(end_port - start_port) + 1);

    let created_at = now();
    tx.execute(
        "INSERT INTO port_bindings (instance_id, start_port, end_port, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![instance_id, start_port, end_port, created_at.to_rfc3339()],
    )?;
    let binding_id = tx.last_insert_rowid();

    let mut link = tx.prepare_cached("INSERT INTO binding_ports (binding_id, port_id) VALUES (?1, ?2)")?;
    for port_id in port_ids {
        link.execute(params![binding_id, port_id])?;
    }

    Ok(PortBinding {
        id: binding_id,
        instance_id: instance_id.to_string(),
        start_port,
        end_port,
        created_at,
        released_at: None,
    })
}

/// Insert a port row, returning its id. Existing rows are left untouched.
pub(crate) fn insert_port(conn: &Connection, port_number: u16) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO ports (port_number) VALUES (?1)",
        params![port_number],
    )?;
    conn.query_row(
        "SELECT id FROM ports WHERE port_number = ?1",
        params![port_number],
        |row| row.get(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_instance(conn: &Connection, id: &str) {
        conn.execute(
            "INSERT INTO instances (id, name, meta, created_at) VALUES (?1, ?1, '{}', ?2)",
            params![id, now().to_rfc3339()],
        )
        .unwrap();
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
    }

    #[test]
    fn test_file_database_uses_wal() {
        let dir = tempfile::TempDir::new().unwrap();
        let conn = init_db(&dir.path().join("nested").join("gatekeeper.db")).unwrap();
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0)).unwrap();
        assert_eq!(mode, "wal");
    }

    #[test]
    fn test_port_status_follows_active_bindings() {
        let mut conn = open_in_memory().unwrap();
        insert_instance(&conn, "abc");

        let tx = begin_write(&mut conn).unwrap();
        let id = insert_port(&tx, 8000).unwrap();
        let binding = insert_binding(&tx, "abc", 8000, 8000, &[id]).unwrap();
        tx.commit().unwrap();

        assert!(get_port(&conn, 8000).unwrap().unwrap().is_reserved);

        conn.execute(
            "UPDATE port_bindings SET released_at = ?1 WHERE id = ?2",
            params![now().to_rfc3339(), binding.id],
        )
        .unwrap();
        assert!(!get_port(&conn, 8000).unwrap().unwrap().is_reserved);
    }

    #[test]
    fn test_trigger_rejects_double_booking() {
        let mut conn = open_in_memory().unwrap();
        insert_instance(&conn, "abc");

        let tx = begin_write(&mut conn).unwrap();
        let id = insert_port(&tx, 8000).unwrap();
        insert_binding(&tx, "abc", 8000, 8000, &[id]).unwrap();
        assert!(insert_binding(&tx, "abc", 8000, 8000, &[id]).is_err());
    }

    #[test]
    fn test_trigger_rejects_second_release() {
        let mut conn = open_in_memory().unwrap();
        insert_instance(&conn, "abc");

        let tx = begin_write(&mut conn).unwrap();
        let id = insert_port(&tx, 8000).unwrap();
        let binding = insert_binding(&tx, "abc", 8000, 8000, &[id]).unwrap();
        tx.commit().unwrap();

        let release = "UPDATE port_bindings SET released_at = ?1 WHERE id = ?2";
        conn.execute(release, params![now().to_rfc3339(), binding.id]).unwrap();
        assert!(conn.execute(release, params![now().to_rfc3339(), binding.id]).is_err());
    }

    #[test]
    fn test_insert_port_is_idempotent() {
        let conn = open_in_memory().unwrap();
        let first = insert_port(&conn, 8000).unwrap();
        let second = insert_port(&conn, 8000).unwrap();
        assert_eq!(first, second);
    }
}
