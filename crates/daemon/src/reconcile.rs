//! Ingestion of ports observed listening on hosts.
//!
//! Observations only make ports known to the pool. They never create
//! bindings, so an observed port stays a free candidate for the allocator.

use common::Port;
use rusqlite::Connection;
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::config::PoolConfig;
use crate::db;
use crate::error::{GatekeeperError, Result};

/// Return the port rows for `observed`, creating the missing ones.
///
/// Numbers outside the configured range are dropped. The result is
/// deduplicated and ascending.
pub fn get_or_create_ports(conn: &mut Connection, config: &PoolConfig, observed: &[u16]) -> Result<Vec<Port>> {
    let wanted: BTreeSet<u16> = observed
        .iter()
        .copied()
        .filter(|port| config.range.contains(*port))
        .collect();
    debug!(
        observed = observed.len(),
        in_range = wanted.len(),
        "ingesting observed ports"
    );

    let tx = db::begin_write(conn)?;
    let mut created = 0usize;
    let mut ports = Vec::with_capacity(wanted.len());
    for port_number in wanted {
        if db::get_port(&tx, port_number)?.is_none() {
            db::insert_port(&tx, port_number)?;
            created += 1;
        }
        let port = db::get_port(&tx, port_number)?
            .ok_or_else(|| GatekeeperError::Internal(format!("port {} vanished", port_number)))?;
        ports.push(port);
    }
    tx.commit()?;

    if created > 0 {
        info!(created, known = ports.len(), "recorded observed ports");
    }
    Ok(ports)
}

/// Create a row for every port of the configured range. Returns how many were new.
pub fn seed_pool(conn: &mut Connection, config: &PoolConfig) -> Result<usize> {
    let tx = db::begin_write(conn)?;
    let mut created = 0usize;
    {
        let mut stmt = tx.prepare("INSERT OR IGNORE INTO ports (port_number) VALUES (?1)")?;
        for port in config.range.start()..config.range.end() {
            created += stmt.execute([port])?;
        }
    }
    tx.commit()?;

    info!(created, start = config.range.start(), end = config.range.end(), "seeded port pool");
    Ok(created)
}
