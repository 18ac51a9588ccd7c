//! In-memory session table keyed by probe id.
//!
//! The table is the only shared mutable state in the service. Entries are
//! registered by the dispatcher, owned through an RAII guard by whichever
//! task runs the session (supervisor for debug/print, the dispatch itself
//! for flash), and removed when the guard drops. `stop` cancels matching
//! entries cooperatively and waits until their guards are gone, i.e. until
//! the probe lock is released.

use super::types::{SessionInfo, SessionKind, SessionState, StopKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct Entry {
    info: SessionInfo,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<u32, Entry>,
    /// Bumped by every `stop kind=all`; lets a dispatch notice a stop that
    /// raced it during upload/staging.
    stop_epochs: HashMap<u32, u64>,
}

/// Thread-safe registry of live sessions.
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<Mutex<Inner>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for its probe. Fails if the probe already has
    /// one; the probe lock makes that unreachable in normal operation.
    ///
    /// Returns the owner guard plus the cancellation token the session
    /// task must obey.
    pub fn register(
        &self,
        info: SessionInfo,
    ) -> Result<(SessionGuard, CancellationToken), AlreadyActive> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.sessions.contains_key(&info.probe_id) {
            return Err(AlreadyActive(info.probe_id));
        }

        let probe_id = info.probe_id;
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(false);
        info!(probe_id, kind = %info.kind, "session registered");
        inner.sessions.insert(
            probe_id,
            Entry {
                info,
                cancel: cancel.clone(),
                done: rx,
            },
        );

        Ok((
            SessionGuard {
                table: self.clone(),
                probe_id,
                done: tx,
            },
            cancel,
        ))
    }

    /// Update the recorded lifecycle state.
    pub fn set_state(&self, probe_id: u32, state: SessionState) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.sessions.get_mut(&probe_id) {
            debug!(probe_id, state = %state, "session state");
            entry.info.state = state;
        }
    }

    /// Snapshot of the session owning `probe_id`, if any.
    pub fn snapshot(&self, probe_id: u32) -> Option<SessionInfo> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.sessions.get(&probe_id).map(|e| e.info.clone())
    }

    /// Snapshots of every live session.
    pub fn list(&self) -> Vec<SessionInfo> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.sessions.values().map(|e| e.info.clone()).collect()
    }

    /// Current stop epoch for a probe.
    pub fn stop_epoch(&self, probe_id: u32) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.stop_epochs.get(&probe_id).copied().unwrap_or(0)
    }

    /// Cancel sessions on `probe_id` selected by `kind` and wait until
    /// their owners have released everything (lock included). Returns the
    /// kinds that were stopped; empty means there was nothing to stop.
    ///
    /// `kind=all` bumps the stop epoch even when no session is live, so a
    /// dispatch racing this call (still uploading, not yet registered)
    /// aborts instead of starting work the caller just asked to end.
    pub async fn stop(&self, probe_id: u32, kind: StopKind) -> Vec<SessionKind> {
        let targets: Vec<(SessionKind, CancellationToken, watch::Receiver<bool>)> = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if kind == StopKind::All {
                *inner.stop_epochs.entry(probe_id).or_insert(0) += 1;
            }
            inner
                .sessions
                .get(&probe_id)
                .filter(|e| kind.matches(e.info.kind))
                .map(|e| (e.info.kind, e.cancel.clone(), e.done.clone()))
                .into_iter()
                .collect()
        };

        let mut stopped = Vec::new();
        for (session_kind, cancel, mut done) in targets {
            info!(probe_id, kind = %session_kind, "forcing session stop");
            cancel.cancel();
            // Sender dropped (owner gone) also counts as done.
            let _ = done.wait_for(|finished| *finished).await;
            stopped.push(session_kind);
        }
        stopped
    }
}

/// A probe already has a live session.
#[derive(Debug)]
pub struct AlreadyActive(pub u32);

/// Ownership of one table entry. Dropping the guard removes the entry and
/// wakes every `stop` waiter; the owner must release the probe lock before
/// dropping the guard.
pub struct SessionGuard {
    table: SessionTable,
    probe_id: u32,
    done: watch::Sender<bool>,
}

impl SessionGuard {
    pub fn probe_id(&self) -> u32 {
        self.probe_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut inner = self
            .table
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        inner.sessions.remove(&self.probe_id);
        drop(inner);
        let _ = self.done.send(true);
        debug!(probe_id = self.probe_id, "session removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortBases;

    fn info(probe_id: u32, kind: SessionKind) -> SessionInfo {
        SessionInfo::new(
            probe_id,
            kind,
            "debug-box-arm-p1".to_string(),
            Some(4242),
            PortBases::default().plan(probe_id),
        )
    }

    #[test]
    fn one_session_per_probe() {
        let table = SessionTable::new();
        let (_guard, _cancel) = table.register(info(1, SessionKind::Debug)).unwrap();
        assert!(table.register(info(1, SessionKind::Print)).is_err());
        // A different probe does not conflict.
        assert!(table.register(info(2, SessionKind::Debug)).is_ok());
    }

    #[test]
    fn guard_drop_removes_entry() {
        let table = SessionTable::new();
        let (guard, _cancel) = table.register(info(1, SessionKind::Debug)).unwrap();
        assert!(table.snapshot(1).is_some());
        drop(guard);
        assert!(table.snapshot(1).is_none());
        // Re-registration works after removal.
        assert!(table.register(info(1, SessionKind::Debug)).is_ok());
    }

    #[tokio::test]
    async fn stop_cancels_and_waits_for_owner() {
        let table = SessionTable::new();
        let (guard, cancel) = table.register(info(1, SessionKind::Debug)).unwrap();

        let owner = tokio::spawn(async move {
            cancel.cancelled().await;
            drop(guard);
        });

        let stopped = table.stop(1, StopKind::All).await;
        assert_eq!(stopped, vec![SessionKind::Debug]);
        assert!(table.snapshot(1).is_none());
        owner.await.unwrap();
    }

    #[tokio::test]
    async fn stop_filters_by_kind() {
        let table = SessionTable::new();
        let (_guard, _cancel) = table.register(info(1, SessionKind::Print)).unwrap();

        let stopped = table.stop(1, StopKind::Debug).await;
        assert!(stopped.is_empty());
        assert!(table.snapshot(1).is_some(), "print session untouched");
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let table = SessionTable::new();
        let (guard, cancel) = table.register(info(1, SessionKind::Debug)).unwrap();
        tokio::spawn(async move {
            cancel.cancelled().await;
            drop(guard);
        });

        assert_eq!(table.stop(1, StopKind::All).await.len(), 1);
        assert!(table.stop(1, StopKind::All).await.is_empty());
    }

    #[tokio::test]
    async fn stop_all_bumps_epoch_without_session() {
        let table = SessionTable::new();
        let before = table.stop_epoch(7);
        assert!(table.stop(7, StopKind::All).await.is_empty());
        assert_eq!(table.stop_epoch(7), before + 1);

        // kind-filtered stops leave the epoch alone
        table.stop(7, StopKind::Debug).await;
        assert_eq!(table.stop_epoch(7), before + 1);
    }

    #[test]
    fn set_state_updates_snapshot() {
        let table = SessionTable::new();
        let (_guard, _cancel) = table.register(info(1, SessionKind::Debug)).unwrap();
        table.set_state(1, SessionState::Attached);
        assert_eq!(table.snapshot(1).unwrap().state, SessionState::Attached);
    }
}
