//! # Read Loop
//!
//! Drives a Connected endpoint: calls [`Pump::process_next_message`] until the
//! endpoint is canceled or a fault is reported, by the pump or by a failed
//! write, then settles the state and every outstanding call.
//!
//! ## Invariants
//! - Once running, this loop is the only writer of the connection state.
//! - The terminal state is published before pending calls are failed, so a
//!   caller woken by a fault already observes `Faulted`.
//! - Cancellation yields `Closed`; anything else yields `Faulted`.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::error::Error;
use crate::error::Fault;
use crate::pending::PendingCalls;
use crate::state::ConnectionState;
use crate::state::StateCell;
use crate::stream::FrameWriter;
use crate::stream::Pump;

pub(crate) struct ReadLoop {
    pub(crate) endpoint: String,
    pub(crate) pump: Pump,
    pub(crate) state: Arc<StateCell>,
    pub(crate) pending: Arc<PendingCalls>,
    pub(crate) writer: Arc<FrameWriter>,
    pub(crate) cancel: CancellationToken,
}

impl ReadLoop {
    pub(crate) async fn run(mut self) {
        let fault: Option<Fault> = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break None,
                fault = self.writer.failed() => break Some(fault),
                result = self.pump.process_next_message() => {
                    if let Err(fault) = result {
                        break Some(fault);
                    }
                }
            }
        };

        match fault {
            None => {
                debug!(endpoint = %self.endpoint, "connection closed");
                self.state.transition(ConnectionState::Closed);
                self.pending.fail_all(Error::Canceled);
            }
            Some(fault) => {
                warn!(
                    endpoint = %self.endpoint,
                    kind = ?fault.kind,
                    error = %fault,
                    outstanding = self.pending.len(),
                    "connection faulted"
                );
                self.state.fail(fault.clone());
                self.pending.fail_all(Error::Fault(fault));
            }
        }

        self.writer.shutdown().await;
    }
}
