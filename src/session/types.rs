//! Session and session info types.

use crate::ports::PortPlan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What kind of work owns the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Debug,
    Print,
    Flash,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Debug => "debug",
            SessionKind::Print => "print",
            SessionKind::Flash => "flash",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filter for `/session/stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopKind {
    Debug,
    Print,
    #[default]
    All,
}

impl StopKind {
    /// Whether a session of `kind` is selected by this filter. `all` also
    /// selects in-flight flash dispatches.
    pub fn matches(self, kind: SessionKind) -> bool {
        match self {
            StopKind::All => true,
            StopKind::Debug => kind == SessionKind::Debug,
            StopKind::Print => kind == SessionKind::Print,
        }
    }
}

impl FromStr for StopKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(StopKind::Debug),
            "print" => Ok(StopKind::Print),
            "all" => Ok(StopKind::All),
            other => Err(format!(
                "invalid kind '{other}', must be 'debug', 'print' or 'all'"
            )),
        }
    }
}

/// Lifecycle state of a long-lived session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Server spawned, waiting for the first client within the attach grace.
    AwaitingClient,
    /// At least one client connected to the primary port.
    Attached,
    /// All clients gone (debounced); termination committed. A client
    /// attaching now does not cancel shutdown.
    Draining,
    /// Terminal.
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::AwaitingClient => "awaiting_client",
            SessionState::Attached => "attached",
            SessionState::Draining => "draining",
            SessionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Why a session reached `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    AttachTimeout,
    ServerExited,
    ClientDisconnected,
    Forced,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::AttachTimeout => "attach_timeout",
            StopReason::ServerExited => "server_exited",
            StopReason::ClientDisconnected => "client_disconnected",
            StopReason::Forced => "forced",
        };
        f.write_str(s)
    }
}

/// Serializable snapshot of one live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub probe_id: u32,
    pub kind: SessionKind,
    pub state: SessionState,
    pub container: String,
    /// Host-side pid of the exec client, if the spawn reported one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub gdb_port: u16,
    pub telnet_port: u16,
    pub rtt_port: u16,
    pub print_port: u16,
    pub started_at: DateTime<Utc>,
}

impl SessionInfo {
    pub fn new(
        probe_id: u32,
        kind: SessionKind,
        container: String,
        pid: Option<u32>,
        ports: PortPlan,
    ) -> Self {
        Self {
            probe_id,
            kind,
            state: SessionState::AwaitingClient,
            container,
            pid,
            gdb_port: ports.gdb,
            telnet_port: ports.telnet,
            rtt_port: ports.rtt,
            print_port: ports.print,
            started_at: Utc::now(),
        }
    }

    /// The port whose client connections define attachment: GDB for debug,
    /// print for print bridges.
    pub fn primary_port(&self) -> u16 {
        match self.kind {
            SessionKind::Print => self.print_port,
            _ => self.gdb_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortBases;

    #[test]
    fn stop_kind_filtering() {
        assert!(StopKind::All.matches(SessionKind::Debug));
        assert!(StopKind::All.matches(SessionKind::Flash));
        assert!(StopKind::Debug.matches(SessionKind::Debug));
        assert!(!StopKind::Debug.matches(SessionKind::Print));
        assert!(!StopKind::Print.matches(SessionKind::Flash));
    }

    #[test]
    fn stop_kind_parses() {
        assert_eq!("all".parse::<StopKind>().unwrap(), StopKind::All);
        assert_eq!("debug".parse::<StopKind>().unwrap(), StopKind::Debug);
        assert!("gdb".parse::<StopKind>().is_err());
    }

    #[test]
    fn primary_port_follows_kind() {
        let ports = PortBases::default().plan(2);
        let debug = SessionInfo::new(2, SessionKind::Debug, "c".into(), None, ports);
        assert_eq!(debug.primary_port(), ports.gdb);
        let print = SessionInfo::new(2, SessionKind::Print, "c".into(), None, ports);
        assert_eq!(print.primary_port(), ports.print);
    }
}
