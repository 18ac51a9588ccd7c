//! Client-presence sampling from the kernel socket tables.
//!
//! Toolchain containers run with host networking, so every server socket is
//! visible in the host's `/proc/net/tcp` and `/proc/net/tcp6`. Attachment
//! is defined as the count of ESTABLISHED connections whose local port is
//! the session's primary port.

use std::path::PathBuf;

/// TCP_ESTABLISHED in the procfs `st` column.
const STATE_ESTABLISHED: &str = "01";

/// Reads the socket tables at a fixed set of paths.
#[derive(Debug, Clone)]
pub struct PresenceSampler {
    tables: Vec<PathBuf>,
}

impl PresenceSampler {
    /// Sample the host view.
    pub fn host() -> Self {
        Self {
            tables: vec![
                PathBuf::from("/proc/net/tcp"),
                PathBuf::from("/proc/net/tcp6"),
            ],
        }
    }

    /// Sample through a specific process's namespace view. Used as the
    /// belt-and-braces check against the server's own socket table.
    pub fn for_pid(pid: u32) -> Self {
        Self {
            tables: vec![
                PathBuf::from(format!("/proc/{pid}/net/tcp")),
                PathBuf::from(format!("/proc/{pid}/net/tcp6")),
            ],
        }
    }

    #[cfg(test)]
    pub fn from_paths(tables: Vec<PathBuf>) -> Self {
        Self { tables }
    }

    /// Count ESTABLISHED connections with `port` as the local port.
    /// Unreadable tables count as empty: a vanished procfs entry means the
    /// process is gone, which the supervisor notices separately.
    pub fn established(&self, port: u16) -> usize {
        self.tables
            .iter()
            .filter_map(|path| std::fs::read_to_string(path).ok())
            .map(|table| count_established(&table, port))
            .sum()
    }
}

/// Count ESTABLISHED entries for a local port in one procfs table.
pub fn count_established(table: &str, port: u16) -> usize {
    table
        .lines()
        .skip(1)
        .filter(|line| {
            let mut fields = line.split_whitespace();
            let local = match fields.nth(1) {
                Some(l) => l,
                None => return false,
            };
            let state = match fields.nth(1) {
                Some(s) => s,
                None => return false,
            };
            state == STATE_ESTABLISHED && local_port(local) == Some(port)
        })
        .count()
}

/// Local port from a `hexaddr:hexport` procfs address field.
fn local_port(local_address: &str) -> Option<u16> {
    let (_, port_hex) = local_address.rsplit_once(':')?;
    u16::from_str_radix(port_hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    // 3331 = 0x0D03
    const TABLE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:0D03 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 10001 1 0000000000000000 100 0 0 10 0
   1: 0100007F:0D03 0100007F:A1B2 01 00000000:00000000 00:00000000 00000000  1000        0 10002 1 0000000000000000 20 4 30 10 -1
   2: 0100007F:0D03 0100007F:A1B3 01 00000000:00000000 00:00000000 00000000  1000        0 10003 1 0000000000000000 20 4 30 10 -1
   3: 0100007F:1F90 0100007F:A1B4 01 00000000:00000000 00:00000000 00000000  1000        0 10004 1 0000000000000000 20 4 30 10 -1
   4: 0100007F:0D03 0100007F:A1B5 06 00000000:00000000 00:00000000 00000000  1000        0 10005 1 0000000000000000 20 4 30 10 -1
";

    #[test]
    fn counts_only_established_on_port() {
        // Two ESTABLISHED on 3331; the LISTEN socket, the TIME_WAIT entry
        // and the foreign port do not count.
        assert_eq!(count_established(TABLE, 3331), 2);
    }

    #[test]
    fn other_port_counts_separately() {
        assert_eq!(count_established(TABLE, 8080), 1);
        assert_eq!(count_established(TABLE, 3332), 0);
    }

    #[test]
    fn header_and_garbage_tolerated() {
        assert_eq!(count_established("", 3331), 0);
        assert_eq!(count_established("header only\n", 3331), 0);
        assert_eq!(count_established("x\nnot a socket line\n", 3331), 0);
    }

    #[test]
    fn local_port_parses_hex() {
        assert_eq!(local_port("0100007F:0D03"), Some(0x0D03));
        assert_eq!(
            local_port("00000000000000000000000001000000:0D03"),
            Some(0x0D03)
        );
        assert_eq!(local_port("garbage"), None);
    }

    #[test]
    fn sampler_sums_tables() {
        let dir = tempfile::TempDir::new().unwrap();
        let tcp = dir.path().join("tcp");
        let tcp6 = dir.path().join("tcp6");
        std::fs::write(&tcp, TABLE).unwrap();
        std::fs::write(&tcp6, TABLE).unwrap();

        let sampler = PresenceSampler::from_paths(vec![tcp, tcp6]);
        assert_eq!(sampler.established(3331), 4);

        let missing = PresenceSampler::from_paths(vec![dir.path().join("nope")]);
        assert_eq!(missing.established(3331), 0);
    }
}
