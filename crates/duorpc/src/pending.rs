//! # Pending-Call Table
//!
//! Outstanding calls keyed by correlation id.
//!
//! ## Invariants
//! - **Exactly Once**: an entry is resolved by whoever removes it from the map.
//!   Removal is atomic, and the sender moves out with the entry, so a second
//!   resolution has nothing left to send on.
//! - **Unique Ids**: ids come from a monotonic counter, and insertion skips any
//!   id still occupied after wrap-around.
//! - **Sealed After Fault**: once [`PendingCalls::fail_all`] runs, registration
//!   fails. An entry that races the seal is removed again by its registrar.

use std::sync::OnceLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use duowire::CallId;
use duowire::Outcome;
use tokio::sync::oneshot;

use crate::error::Error;

/// What a pending call eventually receives.
pub(crate) type Resolution = Result<Outcome, Error>;

struct PendingCall {
    tx: oneshot::Sender<Resolution>,
}

pub(crate) struct PendingCalls {
    calls: DashMap<CallId, PendingCall>,
    next_id: AtomicU64,
    sealed: AtomicBool,
    reason: OnceLock<Error>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self {
            calls: DashMap::new(),
            next_id: AtomicU64::new(1),
            sealed: AtomicBool::new(false),
            reason: OnceLock::new(),
        }
    }

    /// Allocates an id and registers a slot for its resolution.
    pub(crate) fn register(&self) -> Result<(CallId, oneshot::Receiver<Resolution>), Error> {
        if self.sealed.load(Ordering::SeqCst) {
            return Err(self.sealed_reason());
        }

        let (tx, rx) = oneshot::channel();
        let mut call = Some(PendingCall { tx });

        let id = loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if let Entry::Vacant(slot) = self.calls.entry(id) {
                if let Some(call) = call.take() {
                    slot.insert(call);
                }
                break id;
            }
        };

        // fail_all may have drained between our check and the insert.
        if self.sealed.load(Ordering::SeqCst) && self.calls.remove(&id).is_some() {
            return Err(self.sealed_reason());
        }

        Ok((id, rx))
    }

    /// Delivers `outcome` to the call with this id. Returns false if the call
    /// was already resolved, canceled or never existed.
    pub(crate) fn resolve(&self, id: CallId, outcome: Outcome) -> bool {
        match self.calls.remove(&id) {
            Some((_, call)) => {
                // The caller may have stopped waiting; the entry is gone either way.
                let _ = call.tx.send(Ok(outcome));
                true
            }
            None => false,
        }
    }

    /// Removes the entry without resolving it. Returns false if someone else
    /// resolved it first.
    pub(crate) fn cancel(&self, id: CallId) -> bool {
        self.calls.remove(&id).is_some()
    }

    /// Seals the table and resolves every outstanding call with `reason`.
    pub(crate) fn fail_all(&self, reason: Error) {
        let _ = self.reason.set(reason.clone());
        self.sealed.store(true, Ordering::SeqCst);

        let ids: Vec<CallId> = self.calls.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, call)) = self.calls.remove(&id) {
                let _ = call.tx.send(Err(reason.clone()));
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }

    fn sealed_reason(&self) -> Error {
        self.reason.get().cloned().unwrap_or(Error::Canceled)
    }
}
