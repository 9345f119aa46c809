//! Read-only listings of ports and bindings.

use common::{BindingQuery, Port, PortBinding, PortQuery};
use rusqlite::{params, Connection};

use crate::db;
use crate::error::Result;
use crate::registry;

/// Ports known to the pool, ascending by number.
///
/// With `instance_id`, only ports held by that instance's active bindings.
pub fn list_ports(conn: &Connection, query: &PortQuery) -> Result<Vec<Port>> {
    if let Some(id) = &query.instance_id {
        registry::get(conn, id)?;
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM port_status p
         WHERE (?1 IS NULL OR p.is_reserved = ?1)
           AND (?2 IS NULL OR EXISTS (
               SELECT 1 FROM binding_ports bp
               JOIN port_bindings b ON b.id = bp.binding_id
               WHERE bp.port_id = p.id AND b.released_at IS NULL AND b.instance_id = ?2
           ))
         ORDER BY p.port_number",
        db::PORT_COLUMNS
    ))?;
    let ports = stmt
        .query_map(params![query.is_reserved, query.instance_id], db::port_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ports)
}

/// Binding history, newest first.
pub fn list_bindings(conn: &Connection, query: &BindingQuery) -> Result<Vec<PortBinding>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM port_bindings
         WHERE (?1 IS NULL OR instance_id = ?1)
           AND (?2 IS NULL OR (released_at IS NULL) = ?2)
         ORDER BY id DESC",
        db::BINDING_COLUMNS
    ))?;
    let bindings = stmt
        .query_map(params![query.instance_id, query.active], db::binding_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(bindings)
}
