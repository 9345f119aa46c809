//! Port allocator.
//!
//! Ranges are handed out by scanning the free ports in ascending order for
//! the first run of `size` numerically adjacent entries. Released ports are
//! reused before the pool grows; when no run exists, fresh port rows are
//! created just above the highest known port, up to the configured ceiling.
//!
//! Each reservation runs in a single immediate transaction, so the scan and
//! the write that claims the window form one critical section across every
//! connection to the database.

use common::PortBinding;
use rusqlite::{params, Connection, Transaction};
use tracing::{debug, info, warn};

use crate::config::{PoolConfig, PortRange};
use crate::db;
use crate::error::{GatekeeperError, Result};
use crate::registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreePort {
    id: i64,
    port_number: u16,
}

/// Reserve `size` ports for an instance; `None` means a single port.
///
/// Entry point for requests that carry an unvalidated size.
pub fn reserve(
    conn: &mut Connection,
    config: &PoolConfig,
    instance_id: &str,
    size: Option<i64>,
) -> Result<PortBinding> {
    match size {
        None | Some(1) => reserve_single(conn, config, instance_id),
        Some(n) if n > 1 => {
            let size = u32::try_from(n)
                .map_err(|_| GatekeeperError::InvalidRequest(format!("range {} is too large", n)))?;
            reserve_range(conn, config, instance_id, size)
        }
        Some(n) => Err(GatekeeperError::InvalidRequest(format!(
            "range must be a positive number of ports, got {}",
            n
        ))),
    }
}

/// Reserve `size` numerically contiguous ports.
pub fn reserve_range(
    conn: &mut Connection,
    config: &PoolConfig,
    instance_id: &str,
    size: u32,
) -> Result<PortBinding> {
    if size == 0 {
        return Err(GatekeeperError::InvalidRequest(
            "range must be a positive number of ports".to_string(),
        ));
    }
    let range = config.range;

    let tx = db::begin_write(conn)?;
    registry::get(&tx, instance_id)?;

    let candidates = free_ports(&tx, &range, None)?;
    let numbers: Vec<u16> = candidates.iter().map(|p| p.port_number).collect();
    debug!(size, free = candidates.len(), "scanning free ports for a contiguous window");

    let binding = match find_window(&numbers, size) {
        Some(offset) => {
            let window = &candidates[offset..offset + size as usize];
            let ids: Vec<i64> = window.iter().map(|p| p.id).collect();
            let start = window[0].port_number;
            let end = window[window.len() - 1].port_number;
            debug!(start, end, "reusing free window");
            db::insert_binding(&tx, instance_id, start, end, &ids)?
        }
        None => grow(&tx, &range, instance_id, size)?,
    };

    tx.commit()?;
    info!(instance_id, ports = %binding, binding_id = binding.id, "reserved port range");
    Ok(binding)
}

/// Reserve one port: the lowest free port, or the next port above the pool.
pub fn reserve_single(
    conn: &mut Connection,
    config: &PoolConfig,
    instance_id: &str,
) -> Result<PortBinding> {
    let range = config.range;

    let tx = db::begin_write(conn)?;
    registry::get(&tx, instance_id)?;

    let binding = match free_ports(&tx, &range, Some(1))?.first() {
        Some(port) => db::insert_binding(&tx, instance_id, port.port_number, port.port_number, &[port.id])?,
        None => grow(&tx, &range, instance_id, 1)?,
    };

    tx.commit()?;
    info!(instance_id, port = binding.start_port, binding_id = binding.id, "reserved port");
    Ok(binding)
}

/// Offset of the first window of `size` entries in `sorted` whose numbers are
/// adjacent, i.e. whose last entry is exactly `size - 1` above its first.
///
/// `sorted` must be strictly ascending.
pub fn find_window(sorted: &[u16], size: u32) -> Option<usize> {
    let size = usize::try_from(size).ok().filter(|&s| s > 0)?;
    sorted.windows(size).position(|window| {
        u32::from(window[size - 1]) == u32::from(window[0]) + (size as u32 - 1)
    })
}

/// Free ports inside the configured range, ascending.
fn free_ports(conn: &Connection, range: &PortRange, limit: Option<u32>) -> Result<Vec<FreePort>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, port_number FROM port_status
         WHERE is_reserved = 0 AND port_number >= ?1 AND port_number < ?2
         ORDER BY port_number
         LIMIT ?3",
    )?;
    // A negative LIMIT means no limit in SQLite.
    let limit = limit.map(i64::from).unwrap_or(-1);
    let ports = stmt
        .query_map(params![range.start(), range.end(), limit], |row| {
            Ok(FreePort {
                id: row.get(0)?,
                port_number: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ports)
}

/// First port number above everything the pool already knows.
fn next_unallocated(conn: &Connection, range: &PortRange) -> Result<u32> {
    let max: Option<u16> = conn.query_row("SELECT MAX(port_number) FROM ports", [], |row| row.get(0))?;
    let start = u32::from(range.start());
    Ok(max.map_or(start, |max| (u32::from(max) + 1).max(start)))
}

/// Extend the pool with `size` new ports and bind them.
fn grow(tx: &Transaction<'_>, range: &PortRange, instance_id: &str, size: u32) -> Result<PortBinding> {
    let next = next_unallocated(tx, range)?;
    let last = match next.checked_add(size - 1) {
        Some(last) if last < u32::from(range.end()) => last,
        _ => {
            warn!(instance_id, size, next, "port pool exhausted");
            return Err(GatekeeperError::PoolExhausted {
                size,
                start: range.start(),
                end: range.end(),
            });
        }
    };

    // Both bounds are below `range.end()`, so they fit in a u16.
    let (start, end) = (next as u16, last as u16);
    debug!(start, end, "growing port pool");
    let ids = (start..=end)
        .map(|port| db::insert_port(tx, port))
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(db::insert_binding(tx, instance_id, start, end, &ids)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle;
    use crate::registry::NewInstance;
    use std::collections::HashSet;

    fn setup(start: u16, end: u16, instances: &[&str]) -> (Connection, PoolConfig) {
        let mut conn = db::open_in_memory().unwrap();
        for id in instances {
            join(&mut conn, id);
        }
        (conn, PoolConfig::new(start, end).unwrap())
    }

    fn join(conn: &mut Connection, id: &str) {
        registry::join(
            conn,
            NewInstance {
                id: id.to_string(),
                name: id.to_string(),
                meta: Default::default(),
            },
        )
        .unwrap();
    }

    fn span(binding: &PortBinding) -> (u16, u16) {
        (binding.start_port, binding.end_port)
    }

    #[test]
    fn test_find_window() {
        assert_eq!(find_window(&[8000, 8001, 8002], 3), Some(0));
        assert_eq!(find_window(&[8000, 8002, 8003, 8004], 3), Some(1));
        assert_eq!(find_window(&[8000, 8002, 8004, 8006], 2), None);
        assert_eq!(find_window(&[8000, 8001], 3), None);
        assert_eq!(find_window(&[], 1), None);
        assert_eq!(find_window(&[8000], 0), None);
    }

    #[test]
    fn test_find_window_prefers_lowest_start() {
        assert_eq!(find_window(&[8000, 8001, 8005, 8006], 2), Some(0));
        assert_eq!(find_window(&[8000, 8003, 8004, 8006, 8007], 2), Some(1));
    }

    #[test]
    fn test_exhaustion_boundary() {
        let (mut conn, config) = setup(8000, 8005, &["abc"]);

        for expected in 8000..8003 {
            let binding = reserve_single(&mut conn, &config, "abc").unwrap();
            assert_eq!(span(&binding), (expected, expected));
        }

        let err = reserve_range(&mut conn, &config, "abc", 3).unwrap_err();
        assert!(matches!(err, GatekeeperError::PoolExhausted { size: 3, .. }));

        let binding = reserve_range(&mut conn, &config, "abc", 2).unwrap();
        assert_eq!(span(&binding), (8003, 8004));

        assert!(matches!(
            reserve_single(&mut conn, &config, "abc"),
            Err(GatekeeperError::PoolExhausted { size: 1, .. })
        ));
    }

    #[test]
    fn test_released_window_is_reused_before_growth() {
        let (mut conn, config) = setup(8000, 9000, &["abc"]);

        let first = reserve_range(&mut conn, &config, "abc", 3).unwrap();
        assert_eq!(span(&first), (8000, 8002));

        lifecycle::release_by_range(&mut conn, &config, 8000, 8002, Some("abc")).unwrap();

        let again = reserve_range(&mut conn, &config, "abc", 3).unwrap();
        assert_eq!(span(&again), (8000, 8002));
        assert_ne!(first.id, again.id);
    }

    #[test]
    fn test_range_is_contiguous_and_reserved() {
        let (mut conn, config) = setup(8000, 9000, &["abc"]);
        let binding = reserve_range(&mut conn, &config, "abc", 4).unwrap();
        assert_eq!(binding.size(), 4);

        for port in binding.port_numbers() {
            assert!(db::get_port(&conn, port).unwrap().unwrap().is_reserved);
        }
        let linked: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM binding_ports WHERE binding_id = ?1",
                params![binding.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(linked, 4);
    }

    #[test]
    fn test_scattered_free_ports_do_not_form_a_window() {
        let (mut conn, config) = setup(8000, 9000, &["abc"]);
        for _ in 0..4 {
            reserve_single(&mut conn, &config, "abc").unwrap();
        }
        lifecycle::release_by_port(&mut conn, &config, 8000, None).unwrap();
        lifecycle::release_by_port(&mut conn, &config, 8002, None).unwrap();

        let binding = reserve_range(&mut conn, &config, "abc", 2).unwrap();
        assert_eq!(span(&binding), (8004, 8005));

        // The single-port path still picks up the lowest hole.
        let single = reserve_single(&mut conn, &config, "abc").unwrap();
        assert_eq!(span(&single), (8000, 8000));
    }

    #[test]
    fn test_unknown_instance() {
        let (mut conn, config) = setup(8000, 9000, &[]);
        assert!(matches!(
            reserve_range(&mut conn, &config, "ghost", 2),
            Err(GatekeeperError::InstanceNotRegistered(_))
        ));
        assert!(matches!(
            reserve_single(&mut conn, &config, "ghost"),
            Err(GatekeeperError::InstanceNotRegistered(_))
        ));
        let ports: i64 = conn.query_row("SELECT COUNT(*) FROM ports", [], |row| row.get(0)).unwrap();
        assert_eq!(ports, 0);
    }

    #[test]
    fn test_non_positive_size_is_invalid() {
        let (mut conn, config) = setup(8000, 9000, &["abc"]);
        assert!(matches!(
            reserve(&mut conn, &config, "abc", Some(0)),
            Err(GatekeeperError::InvalidRequest(_))
        ));
        assert!(matches!(
            reserve(&mut conn, &config, "abc", Some(-2)),
            Err(GatekeeperError::InvalidRequest(_))
        ));
        let binding = reserve(&mut conn, &config, "abc", None).unwrap();
        assert_eq!(binding.size(), 1);
    }

    #[test]
    fn test_instances_hold_many_bindings() {
        let (mut conn, config) = setup(8000, 9000, &["abc", "xyz"]);
        let a = reserve_range(&mut conn, &config, "abc", 2).unwrap();
        let b = reserve_range(&mut conn, &config, "xyz", 2).unwrap();
        let c = reserve_range(&mut conn, &config, "abc", 2).unwrap();
        assert_eq!(span(&a), (8000, 8001));
        assert_eq!(span(&b), (8002, 8003));
        assert_eq!(span(&c), (8004, 8005));
    }

    #[test]
    fn test_concurrent_reservations_never_double_book() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gatekeeper.db");
        let config = PoolConfig::new(8000, 8010).unwrap();
        let workers: Vec<String> = (0..6).map(|i| format!("instance-{}", i)).collect();

        {
            let mut conn = db::init_db(&path).unwrap();
            for id in &workers {
                join(&mut conn, id);
            }
        }

        let won: Vec<PortBinding> = std::thread::scope(|s| {
            let handles: Vec<_> = workers
                .iter()
                .map(|id| {
                    let path = &path;
                    let config = &config;
                    s.spawn(move || {
                        let mut conn = db::init_db(path).unwrap();
                        let mut won = Vec::new();
                        loop {
                            match reserve_range(&mut conn, config, id, 3) {
                                Ok(binding) => won.push(binding),
                                Err(GatekeeperError::PoolExhausted { .. }) => break,
                                Err(e) => panic!("unexpected error: {}", e),
                            }
                        }
                        won
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        // 10 ports fit three windows of 3.
        assert_eq!(won.len(), 3);
        let mut seen = HashSet::new();
        for binding in &won {
            assert_eq!(binding.size(), 3);
            for port in binding.port_numbers() {
                assert!(seen.insert(port), "port {} handed out twice", port);
            }
        }

        let conn = db::init_db(&path).unwrap();
        let doubled: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM (
                     SELECT bp.port_id FROM binding_ports bp
                     JOIN port_bindings b ON b.id = bp.binding_id
                     WHERE b.released_at IS NULL
                     GROUP BY bp.port_id HAVING COUNT(*) > 1
                 )",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(doubled, 0);
    }
}
