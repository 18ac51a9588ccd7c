//! Deterministic port assignment per probe.
//!
//! Every probe owns one port per service, computed as `base + probe_id`.
//! Stateless and collision-free as long as probe ids are unique and the
//! bases are spaced wider than the largest probe id.

use serde::{Deserialize, Serialize};

/// Default base for GDB server ports.
pub const DEFAULT_GDB_BASE: u16 = 3330;
/// Default base for OpenOCD/J-Link telnet ports.
pub const DEFAULT_TELNET_BASE: u16 = 3430;
/// Default base for RTT ports.
pub const DEFAULT_RTT_BASE: u16 = 3530;
/// Default base for UART print-bridge ports.
pub const DEFAULT_PRINT_BASE: u16 = 3630;

/// Configured port bases, one per service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortBases {
    #[serde(default = "default_gdb_base")]
    pub gdb_base: u16,
    #[serde(default = "default_telnet_base")]
    pub telnet_base: u16,
    #[serde(default = "default_rtt_base")]
    pub rtt_base: u16,
    #[serde(default = "default_print_base")]
    pub print_base: u16,
}

fn default_gdb_base() -> u16 {
    DEFAULT_GDB_BASE
}

fn default_telnet_base() -> u16 {
    DEFAULT_TELNET_BASE
}

fn default_rtt_base() -> u16 {
    DEFAULT_RTT_BASE
}

fn default_print_base() -> u16 {
    DEFAULT_PRINT_BASE
}

impl Default for PortBases {
    fn default() -> Self {
        Self {
            gdb_base: DEFAULT_GDB_BASE,
            telnet_base: DEFAULT_TELNET_BASE,
            rtt_base: DEFAULT_RTT_BASE,
            print_base: DEFAULT_PRINT_BASE,
        }
    }
}

/// The ports allocated to one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortPlan {
    pub gdb: u16,
    pub telnet: u16,
    pub rtt: u16,
    pub print: u16,
}

impl PortBases {
    /// Ports for the given probe id.
    pub fn plan(&self, probe_id: u32) -> PortPlan {
        let id = probe_id as u16;
        PortPlan {
            gdb: self.gdb_base + id,
            telnet: self.telnet_base + id,
            rtt: self.rtt_base + id,
            print: self.print_base + id,
        }
    }
}
