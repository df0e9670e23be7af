//! # Connection State
//!
//! One state value per endpoint, read lock-free by the public API and written
//! by a single owner at a time: the connect path until the read loop starts,
//! the read loop afterwards.
//!
//! ```text
//! NotOpened ──connect/listen──▶ Connecting ──handshake ok──▶ Connected ──cancel──▶ Closed
//!                                   │                            │
//!                                   └──handshake failed──────────┴──error──────▶ Faulted
//! ```
//!
//! ## Invariants
//! - `Closed` and `Faulted` are terminal; no transition leaves them.
//! - The fault is recorded before `Faulted` becomes observable.
//! - Disposing before the read loop starts moves straight to `Closed`.

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use tokio::sync::watch;

use crate::error::Fault;
use crate::error::FaultKind;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    NotOpened = 0,
    Connecting = 1,
    Connected = 2,
    Closed = 3,
    Faulted = 4,
}

impl ConnectionState {
    fn from_u8(b: u8) -> Self {
        match b {
            0 => Self::NotOpened,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Closed,
            _ => Self::Faulted,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Faulted)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotOpened => "not opened",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

pub(crate) struct StateCell {
    current: AtomicU8,
    fault: OnceLock<Fault>,
    notify: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (notify, _) = watch::channel(ConnectionState::NotOpened);
        Self {
            current: AtomicU8::new(ConnectionState::NotOpened as u8),
            fault: OnceLock::new(),
            notify,
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.current.load(Ordering::Acquire))
    }

    /// Claims the single NotOpened → Connecting transition.
    /// Returns the state that prevented it otherwise.
    pub(crate) fn begin_open(&self) -> Result<(), ConnectionState> {
        self.current
            .compare_exchange(
                ConnectionState::NotOpened as u8,
                ConnectionState::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| self.notify.send_replace(ConnectionState::Connecting))
            .map(|_| ())
            .map_err(ConnectionState::from_u8)
    }

    /// Moves to `next` unless already terminal. Returns whether it moved.
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        let mut cur = self.current.load(Ordering::Acquire);
        loop {
            if ConnectionState::from_u8(cur).is_terminal() {
                return false;
            }
            match self.current.compare_exchange(cur, next as u8, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        self.notify.send_replace(next);
        true
    }

    /// Records `fault` and moves to `Faulted`.
    pub(crate) fn fail(&self, fault: Fault) -> bool {
        let _ = self.fault.set(fault);
        self.transition(ConnectionState::Faulted)
    }

    /// Resolves once the state is terminal: `Ok` for Closed, the fault for Faulted.
    ///
    /// Any number of waiters may be pending; all of them observe the same transition.
    pub(crate) async fn wait_terminal(&self) -> Result<(), Fault> {
        let mut rx = self.notify.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|s| s.is_terminal()).await;

        match self.get() {
            ConnectionState::Faulted => Err(self
                .fault
                .get()
                .cloned()
                .unwrap_or_else(|| Fault::new(FaultKind::Io, "unknown fault"))),
            _ => Ok(()),
        }
    }
}
