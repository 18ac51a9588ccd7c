//! The per-session supervisor task.
//!
//! Owns the probe lock, the spawned server, and the table entry for the
//! lifetime of one debug/print session. Drives the state machine
//!
//! ```text
//! AwaitingClient ──(client connects)──▶ Attached ──(all gone, debounced)──▶ Draining ──▶ Stopped
//!       │                                                                       ▲
//!       └──(attach grace expires)──────────────────────────────────────────────┘
//!   any state ──(server exits / forced stop)──▶ Stopped
//! ```
//!
//! Draining is terminal-bound: once entered, a reconnecting client cannot
//! cancel shutdown. The lock is released exactly once, after termination,
//! before stop() waiters are woken.

use super::presence::PresenceSampler;
use super::table::{SessionGuard, SessionTable};
use super::types::{SessionState, StopReason};
use crate::container::{ContainerManager, ServerHandle};
use crate::lock::ProbeLock;
use crate::ports::PortPlan;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Grace period for the first client to attach.
pub const ATTACH_TIMEOUT: Duration = Duration::from_secs(60);
/// How long SIGTERM gets before SIGKILL.
pub const TERM_TIMEOUT: Duration = Duration::from_secs(5);
/// Presence sampling cadence.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
/// Consecutive zero-client samples required to leave Attached.
pub const DISCONNECT_DEBOUNCE_SAMPLES: u32 = 2;

/// What one presence sample means for the attach state. Pure, so the
/// debounce contract is testable without a server.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    attached: bool,
    zero_samples: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Observation {
    /// First client arrived.
    BecameAttached,
    /// Debounce threshold crossed with no clients left.
    Disconnected,
    NoChange,
}

impl PresenceTracker {
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn observe(&mut self, clients: usize) -> Observation {
        if !self.attached {
            if clients > 0 {
                self.attached = true;
                self.zero_samples = 0;
                return Observation::BecameAttached;
            }
            return Observation::NoChange;
        }

        if clients > 0 {
            self.zero_samples = 0;
            return Observation::NoChange;
        }
        self.zero_samples += 1;
        if self.zero_samples >= DISCONNECT_DEBOUNCE_SAMPLES {
            return Observation::Disconnected;
        }
        Observation::NoChange
    }
}

/// Supervises one long-lived session to termination.
pub struct Supervisor {
    probe_id: u32,
    interface: String,
    container: String,
    ports: PortPlan,
    primary_port: u16,
    manager: ContainerManager,
    sampler: PresenceSampler,
    /// Second opinion through the server process's own socket table.
    fallback_sampler: Option<PresenceSampler>,
    table: SessionTable,
    guard: SessionGuard,
    cancel: CancellationToken,
    lock: ProbeLock,
    server: ServerHandle,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        interface: String,
        container: String,
        ports: PortPlan,
        primary_port: u16,
        manager: ContainerManager,
        table: SessionTable,
        guard: SessionGuard,
        cancel: CancellationToken,
        lock: ProbeLock,
        server: ServerHandle,
    ) -> Self {
        let fallback_sampler = server.pid().map(PresenceSampler::for_pid);
        Self {
            probe_id: guard.probe_id(),
            interface,
            container,
            ports,
            primary_port,
            manager,
            sampler: PresenceSampler::host(),
            fallback_sampler,
            table,
            guard,
            cancel,
            lock,
            server,
        }
    }

    /// Run the session to its terminal state. Spawned as its own task by
    /// the dispatcher.
    pub async fn run(mut self) {
        let reason = self.watch().await;
        info!(
            probe_id = self.probe_id,
            reason = %reason,
            "session terminating"
        );

        self.table.set_state(self.probe_id, SessionState::Draining);
        self.terminate().await;
        self.table.set_state(self.probe_id, SessionState::Stopped);

        // Release order matters: the probe lock first, then the table
        // entry, so a stop() waiter that wakes can immediately dispatch.
        let Supervisor { lock, guard, .. } = self;
        drop(lock);
        drop(guard);
    }

    /// Watch until something decides the session is over.
    async fn watch(&mut self) -> StopReason {
        let attach_deadline = tokio::time::Instant::now() + ATTACH_TIMEOUT;
        let mut poll = tokio::time::interval(SAMPLE_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tracker = PresenceTracker::default();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return StopReason::Forced;
                }
                _ = self.server.wait() => {
                    return StopReason::ServerExited;
                }
                _ = tokio::time::sleep_until(attach_deadline),
                    if !tracker.is_attached() =>
                {
                    // A client racing the deadline still counts; sample once
                    // more before giving up.
                    let clients = self.sample_clients();
                    if tracker.observe(clients) != Observation::BecameAttached {
                        return StopReason::AttachTimeout;
                    }
                    self.table.set_state(self.probe_id, SessionState::Attached);
                }
                _ = poll.tick() => {
                    let clients = self.sample_clients();
                    match tracker.observe(clients) {
                        Observation::BecameAttached => {
                            info!(
                                probe_id = self.probe_id,
                                port = self.primary_port,
                                clients,
                                "client attached"
                            );
                            self.table.set_state(self.probe_id, SessionState::Attached);
                        }
                        Observation::Disconnected => {
                            return StopReason::ClientDisconnected;
                        }
                        Observation::NoChange => {}
                    }
                }
            }
        }
    }

    fn sample_clients(&self) -> usize {
        let host = self.sampler.established(self.primary_port);
        let via_pid = self
            .fallback_sampler
            .as_ref()
            .map(|s| s.established(self.primary_port))
            .unwrap_or(0);
        host.max(via_pid)
    }

    /// SIGTERM, bounded wait, SIGKILL escalation, residual-binary sweep.
    async fn terminate(&mut self) {
        self.manager
            .cleanup_servers(&self.container, &self.interface, &self.ports, "-TERM")
            .await;

        if tokio::time::timeout(TERM_TIMEOUT, self.server.wait())
            .await
            .is_err()
        {
            warn!(
                probe_id = self.probe_id,
                container = %self.container,
                "server ignored SIGTERM, escalating"
            );
            self.manager
                .cleanup_servers(&self.container, &self.interface, &self.ports, "-KILL")
                .await;
            let _ = tokio::time::timeout(Duration::from_secs(2), self.server.wait()).await;
        }

        self.server.kill_client().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_contract() {
        assert_eq!(ATTACH_TIMEOUT, Duration::from_secs(60));
        assert_eq!(TERM_TIMEOUT, Duration::from_secs(5));
        // Two samples at the polling cadence give at least a 500 ms
        // debounce window.
        assert!(SAMPLE_INTERVAL * DISCONNECT_DEBOUNCE_SAMPLES >= Duration::from_millis(500));
    }

    #[test]
    fn first_client_attaches() {
        let mut tracker = PresenceTracker::default();
        assert_eq!(tracker.observe(0), Observation::NoChange);
        assert!(!tracker.is_attached());
        assert_eq!(tracker.observe(1), Observation::BecameAttached);
        assert!(tracker.is_attached());
    }

    #[test]
    fn single_zero_sample_does_not_disconnect() {
        let mut tracker = PresenceTracker::default();
        tracker.observe(1);
        assert_eq!(tracker.observe(0), Observation::NoChange);
        assert!(tracker.is_attached());
    }

    #[test]
    fn two_consecutive_zero_samples_disconnect() {
        let mut tracker = PresenceTracker::default();
        tracker.observe(2);
        assert_eq!(tracker.observe(0), Observation::NoChange);
        assert_eq!(tracker.observe(0), Observation::Disconnected);
    }

    #[test]
    fn reconnect_within_debounce_window_resets() {
        let mut tracker = PresenceTracker::default();
        tracker.observe(1);
        assert_eq!(tracker.observe(0), Observation::NoChange);
        assert_eq!(tracker.observe(1), Observation::NoChange);
        assert!(tracker.is_attached());
        // The counter restarted, so one more zero is still not enough.
        assert_eq!(tracker.observe(0), Observation::NoChange);
        assert_eq!(tracker.observe(0), Observation::Disconnected);
    }

    #[test]
    fn reattach_after_attach_keeps_state() {
        let mut tracker = PresenceTracker::default();
        tracker.observe(1);
        assert_eq!(tracker.observe(3), Observation::NoChange);
        assert!(tracker.is_attached());
    }
}
