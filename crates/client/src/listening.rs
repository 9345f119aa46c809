//! Discovery of TCP ports in LISTEN state, read from procfs.

use std::collections::BTreeSet;
use std::fs;

const PROC_TCP_TABLES: &[&str] = &["/proc/net/tcp", "/proc/net/tcp6"];
const TCP_LISTEN: &str = "0A";

/// Local ports with a listening socket, ascending. Missing tables are skipped.
pub fn listening_ports() -> Vec<u16> {
    let mut ports = BTreeSet::new();
    for path in PROC_TCP_TABLES {
        if let Ok(table) = fs::read_to_string(path) {
            ports.extend(parse_tcp_table(&table));
        }
    }
    ports.into_iter().collect()
}

/// Parse one `/proc/net/tcp`-format table.
///
/// Rows look like `0: 0100007F:1F90 00000000:0000 0A ...`, with the local
/// port in hex after the colon and the socket state in the fourth column.
fn parse_tcp_table(table: &str) -> Vec<u16> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let local = fields.nth(1)?;
            let state = fields.nth(1)?;
            if state != TCP_LISTEN {
                return None;
            }
            let (_, port) = local.rsplit_once(':')?;
            u16::from_str_radix(port, 16).ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0
   1: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 2345 1 0000000000000000 100 0 0 10 0
   2: 0100007F:1F90 0100007F:C350 01 00000000:00000000 00:00000000 00000000  1000        0 0 1 0000000000000000 20 4 30 10 -1
";

    const SAMPLE6: &str = "  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:1F41 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 999 1 0000000000000000 100 0 0 10 0
";

    #[test]
    fn test_parse_keeps_only_listening_sockets() {
        assert_eq!(parse_tcp_table(SAMPLE), vec![8080, 22]);
    }

    #[test]
    fn test_parse_ipv6_table() {
        assert_eq!(parse_tcp_table(SAMPLE6), vec![8001]);
    }

    #[test]
    fn test_parse_ignores_garbage() {
        assert!(parse_tcp_table("header\nnot a row\n").is_empty());
        assert!(parse_tcp_table("").is_empty());
    }
}
