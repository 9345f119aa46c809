//! Instance registry: machines join once under a stable fingerprint.

use common::{Instance, InstanceMeta, JoinRequest};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::info;

use crate::db;
use crate::error::{GatekeeperError, Result};

/// Validated input for [`join`].
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub id: String,
    pub name: String,
    pub meta: InstanceMeta,
}

impl TryFrom<JoinRequest> for NewInstance {
    type Error = GatekeeperError;

    fn try_from(req: JoinRequest) -> Result<Self> {
        let id = required(req.instance_id, "instance_id")?;
        let name = required(req.name, "name")?;
        Ok(Self { id, name, meta: req.meta })
    }
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(GatekeeperError::InvalidRequest(format!("{} is required", field))),
    }
}

/// Register a new instance. Joining twice under the same id is `AlreadyRegistered`.
pub fn join(conn: &mut Connection, new: NewInstance) -> Result<Instance> {
    let tx = db::begin_write(conn)?;

    if find(&tx, &new.id)?.is_some() {
        return Err(GatekeeperError::AlreadyRegistered(new.id));
    }

    let meta_json = serde_json::to_string(&new.meta)
        .map_err(|e| GatekeeperError::Internal(format!("failed to encode meta: {}", e)))?;
    let instance = Instance {
        id: new.id,
        name: new.name,
        meta: new.meta,
        created_at: db::now(),
    };

    let inserted = tx.execute(
        "INSERT INTO instances (id, name, meta, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![instance.id, instance.name, meta_json, instance.created_at.to_rfc3339()],
    );
    match inserted {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            return Err(GatekeeperError::AlreadyRegistered(instance.id));
        }
        Err(e) => return Err(e.into()),
    }
    tx.commit()?;

    info!(instance_id = %instance.id, name = %instance.name, "instance joined");
    Ok(instance)
}

pub fn find(conn: &Connection, id: &str) -> Result<Option<Instance>> {
    let instance = conn
        .query_row(
            "SELECT id, name, meta, created_at FROM instances WHERE id = ?1",
            params![id],
            db::instance_from_row,
        )
        .optional()?;
    Ok(instance)
}

pub fn get(conn: &Connection, id: &str) -> Result<Instance> {
    find(conn, id)?.ok_or_else(|| GatekeeperError::InstanceNotRegistered(id.to_string()))
}

/// List registered instances, optionally only those whose name contains `name`.
pub fn list(conn: &Connection, name: Option<&str>) -> Result<Vec<Instance>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, meta, created_at FROM instances
         WHERE ?1 IS NULL OR instr(name, ?1) > 0
         ORDER BY created_at, id",
    )?;
    let instances = stmt
        .query_map(params![name], db::instance_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(instances)
}
