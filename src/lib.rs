//! Debug Probe Hub
//!
//! A shared-hardware dispatcher: one network-accessible service mediating
//! many developers' access to a fixed pool of USB debug probes attached to
//! a single host. Clients ask for work against a named MCU target and a
//! probe; the hub decides which probe+toolchain container can serve the
//! request, serializes access per probe, launches the vendor tool inside a
//! per-probe container, and tears the session down on disconnect or
//! timeout.
//!
//! # Architecture
//!
//! - **HTTP front-end** ([`api`]): `/status`, `/probes`, `/probes/search`,
//!   `/targets`, `/dispatch`, `/session/stop`. Requests run in parallel.
//! - **Dispatcher** ([`dispatch`]): the single decision point. Validates
//!   target/probe/mode/transport, renders the command template, takes the
//!   probe lock, and executes by mode.
//! - **Catalog** ([`config`]): immutable YAML-loaded model of containers,
//!   probes, targets, transport policies, and command templates.
//! - **Inventory** ([`inventory`]): live USB bus view joined with the
//!   catalog; powers status and search.
//! - **Sessions** ([`session`]): a supervisor task per live debug/print
//!   session, holding the probe lock, watching the server process and its
//!   TCP clients, and enforcing attach/disconnect shutdown.
//! - **Containers** ([`container`]): lazy `compose up`, in-container exec,
//!   and process cleanup, one container per (toolchain, probe) pair.
//!
//! Mutual exclusion is one advisory file lock per probe ([`lock`]); ports
//! are deterministic per probe ([`ports`]); uploaded firmware lives in a
//! bind-mounted staging directory for exactly one dispatch ([`staging`]).

pub mod api;
pub mod config;
pub mod container;
pub mod dispatch;
pub mod error;
pub mod inventory;
pub mod lock;
pub mod ports;
pub mod session;
pub mod staging;
pub mod template;

pub use config::{HubConfig, Mode};
pub use dispatch::{DispatchOutcome, DispatchRequest, Dispatcher};
pub use error::DispatchError;
pub use session::{SessionKind, SessionState, SessionTable, StopKind};
