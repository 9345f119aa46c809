//! Releasing bindings.
//!
//! A binding is released exactly once: `released_at` goes from NULL to a
//! timestamp and never changes again. Releasing frees every port linked to
//! the binding, since reserved state is derived from active bindings.

use common::{PortBinding, ReleaseRequest};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::info;

use crate::config::{OwnershipPolicy, PoolConfig};
use crate::db;
use crate::error::{GatekeeperError, Result};
use crate::registry;

/// Release by whichever selector the request carries: a port number, or an
/// exact `start_port`/`end_port` pair.
pub fn release(conn: &mut Connection, config: &PoolConfig, req: &ReleaseRequest) -> Result<PortBinding> {
    let instance_id = req.instance_id.as_deref().filter(|id| !id.is_empty());

    match (req.port_number, req.start_port, req.end_port) {
        (Some(port), None, None) => release_by_port(conn, config, port, instance_id),
        (None, Some(start), Some(end)) => release_by_range(conn, config, start, end, instance_id),
        (None, None, None) => Err(GatekeeperError::InvalidRequest(
            "port_number or start_port and end_port is required".to_string(),
        )),
        _ => Err(GatekeeperError::InvalidRequest(
            "give either port_number or both start_port and end_port".to_string(),
        )),
    }
}

/// Release the active binding that contains `port_number`.
pub fn release_by_port(
    conn: &mut Connection,
    config: &PoolConfig,
    port_number: u16,
    instance_id: Option<&str>,
) -> Result<PortBinding> {
    check_ownership(config, instance_id)?;

    let tx = db::begin_write(conn)?;
    check_instance(&tx, instance_id)?;

    let port = db::get_port(&tx, port_number)?.ok_or(GatekeeperError::PortNotFound(port_number))?;

    let binding = tx
        .query_row(
            "SELECT b.id, b.instance_id, b.start_port, b.end_port, b.created_at, b.released_at
             FROM port_bindings b
             JOIN binding_ports bp ON bp.binding_id = b.id
             WHERE bp.port_id = ?1
               AND b.released_at IS NULL
               AND (?2 IS NULL OR b.instance_id = ?2)",
            params![port.id, instance_id],
            db::binding_from_row,
        )
        .optional()?
        .ok_or_else(|| GatekeeperError::NotBound(format!("port {}", port_number)))?;

    finish(tx, binding)
}

/// Release the active binding spanning exactly `start_port..=end_port`.
pub fn release_by_range(
    conn: &mut Connection,
    config: &PoolConfig,
    start_port: u16,
    end_port: u16,
    instance_id: Option<&str>,
) -> Result<PortBinding> {
    if start_port > end_port {
        return Err(GatekeeperError::InvalidRequest(format!(
            "start_port {} is above end_port {}",
            start_port, end_port
        )));
    }
    check_ownership(config, instance_id)?;

    let tx = db::begin_write(conn)?;
    check_instance(&tx, instance_id)?;

    let mut stmt = tx.prepare(&format!(
        "SELECT {} FROM port_bindings
         WHERE start_port = ?1 AND end_port = ?2
           AND (?3 IS NULL OR instance_id = ?3)
         ORDER BY released_at IS NULL DESC, id DESC
         LIMIT 1",
        db::BINDING_COLUMNS
    ))?;
    let matched = stmt
        .query_row(params![start_port, end_port, instance_id], db::binding_from_row)
        .optional()?;
    drop(stmt);

    let label = format!("{}:{}", start_port, end_port);
    match matched {
        Some(binding) if binding.is_active() => finish(tx, binding),
        Some(_) => Err(GatekeeperError::NotBound(label)),
        None => Err(GatekeeperError::BindingNotFound(label)),
    }
}

fn check_ownership(config: &PoolConfig, instance_id: Option<&str>) -> Result<()> {
    if config.release_ownership == OwnershipPolicy::Required && instance_id.is_none() {
        return Err(GatekeeperError::InvalidRequest(
            "instance_id is required to release ports".to_string(),
        ));
    }
    Ok(())
}

fn check_instance(conn: &Connection, instance_id: Option<&str>) -> Result<()> {
    if let Some(id) = instance_id {
        registry::get(conn, id)?;
    }
    Ok(())
}

fn finish(tx: Transaction<'_>, mut binding: PortBinding) -> Result<PortBinding> {
    let released_at = db::now();
    tx.execute(
        "UPDATE port_bindings SET released_at = ?1 WHERE id = ?2 AND released_at IS NULL",
        params![released_at.to_rfc3339(), binding.id],
    )?;
    tx.commit()?;

    binding.released_at = Some(released_at);
    info!(
        instance_id = %binding.instance_id,
        ports = %binding,
        binding_id = binding.id,
        "released binding"
    );
    Ok(binding)
}
