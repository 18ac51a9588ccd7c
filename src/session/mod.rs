//! Long-lived session supervision.
//!
//! A session is one live `debug` or `print` invocation: a server process in
//! a toolchain container, a port set, and a held probe lock. The dispatcher
//! creates sessions; each is owned by one supervisor task that watches the
//! server process and its clients and tears everything down on disconnect,
//! attach timeout, or forced stop.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                  probe-hub process                     │
//! │                                                        │
//! │  HTTP ──▶ Dispatcher ──▶ SessionTable                  │
//! │                          ├─ probe 1: debug, Attached   │
//! │                          └─ probe 2: print, Awaiting   │
//! │                                 │                      │
//! │            one Supervisor task per entry               │
//! │            ├─ holds the ProbeLock                      │
//! │            ├─ watches the server child                 │
//! │            └─ samples /proc/net/tcp for clients        │
//! └────────────────────────────────────────────────────────┘
//!                 │ docker exec
//!         ┌───────┴────────┐
//!         ▼                ▼
//! ┌───────────────┐ ┌───────────────┐
//! │debug-box-arm-p1│ │debug-box-wch-p2│
//! │ JLinkGDBServer │ │ socat bridge  │
//! └───────────────┘ └───────────────┘
//! ```

mod presence;
pub mod supervisor;
mod table;
mod types;

pub use presence::PresenceSampler;
pub use supervisor::{Supervisor, ATTACH_TIMEOUT, TERM_TIMEOUT};
pub use table::{AlreadyActive, SessionGuard, SessionTable};
pub use types::{SessionInfo, SessionKind, SessionState, StopKind, StopReason};
