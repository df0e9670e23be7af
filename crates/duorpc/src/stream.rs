//! # Stream Wrapper
//!
//! Owns both halves of the transport once the connection is up.
//!
//! - [`FrameWriter`] is the only way to write. Frames are queued to a single
//!   writer task, so they never interleave on the pipe and a caller that
//!   gives up mid-send cannot leave half a frame behind. A failed write is
//!   reported through [`FrameWriter::failed`] so the read loop can fault the
//!   connection.
//! - [`Pump`] is the only way to read. It decodes one frame at a time and
//!   routes it: requests are dispatched on their own task, responses resolve
//!   the pending table.

use std::sync::Arc;
use std::sync::OnceLock;

use bytes::Bytes;
use duowire::CallRequest;
use duowire::CallResponse;
use duowire::Frame;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::dispatch::Dispatcher;
use crate::error::Fault;
use crate::error::FaultKind;
use crate::pending::PendingCalls;
use crate::transport::FrameRead;
use crate::transport::FrameWrite;
use crate::transport::TransportError;

/// Depth of the outbound queue. Senders wait for room once it is full.
const WRITE_QUEUE_DEPTH: usize = 64;

struct Outgoing {
    bytes: Bytes,
    done: oneshot::Sender<Result<(), Fault>>,
}

pub(crate) struct FrameWriter {
    queue: mpsc::Sender<Outgoing>,
    max_frame_size: usize,
    stop: CancellationToken,
    failed: CancellationToken,
    fault: Arc<OnceLock<Fault>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FrameWriter {
    /// Spawns the task that owns `sink`. Must be called inside a runtime.
    pub(crate) fn new(sink: Box<dyn FrameWrite>, max_frame_size: usize) -> Self {
        let (queue, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let stop = CancellationToken::new();
        let failed = CancellationToken::new();
        let fault = Arc::new(OnceLock::new());
        let task = tokio::spawn(write_loop(sink, rx, stop.clone(), failed.clone(), fault.clone()));
        Self {
            queue,
            max_frame_size,
            stop,
            failed,
            fault,
            task: Mutex::new(Some(task)),
        }
    }

    pub(crate) async fn send_request(&self, request: CallRequest) -> crate::Result<()> {
        let bytes = Frame::Request(request).encode()?;
        self.send(bytes).await
    }

    pub(crate) async fn send_response(&self, response: CallResponse) -> crate::Result<()> {
        let bytes = Frame::Response(response).encode()?;
        self.send(bytes).await
    }

    /// Queues one encoded frame and waits until it is on the pipe.
    ///
    /// Dropping this future never tears a frame: once queued, the frame is
    /// written whole or not at all.
    async fn send(&self, bytes: Bytes) -> crate::Result<()> {
        if bytes.len() > self.max_frame_size {
            // Only this call fails; nothing was written.
            return Err(crate::Error::FrameTooLarge {
                size: bytes.len(),
                max: self.max_frame_size,
            });
        }

        let (done, ack) = oneshot::channel();
        if self.queue.send(Outgoing { bytes, done }).await.is_err() {
            return Err(self.closed());
        }
        match ack.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(fault)) => Err(crate::Error::Fault(fault)),
            Err(_) => Err(self.closed()),
        }
    }

    /// Error for a send that found the writer gone.
    fn closed(&self) -> crate::Error {
        match self.fault.get() {
            Some(fault) => crate::Error::Fault(fault.clone()),
            None => crate::Error::Canceled,
        }
    }

    /// Resolves with the fault once a write has failed.
    pub(crate) async fn failed(&self) -> Fault {
        self.failed.cancelled().await;
        self.fault
            .get()
            .cloned()
            .unwrap_or_else(|| Fault::new(FaultKind::Io, "write failed"))
    }

    /// Closes the sending direction. Queued frames are dropped and later
    /// sends fail with `Canceled`.
    pub(crate) async fn shutdown(&self) {
        self.stop.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                debug!(error = %e, "writer task ended abnormally");
            }
        }
    }
}

async fn write_loop(
    mut sink: Box<dyn FrameWrite>,
    mut queue: mpsc::Receiver<Outgoing>,
    stop: CancellationToken,
    failed: CancellationToken,
    fault: Arc<OnceLock<Fault>>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            next = queue.recv() => next,
        };
        let Some(Outgoing { bytes, done }) = next else {
            break;
        };

        let written = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            written = sink.write_frame(bytes) => written,
        };

        match written {
            Ok(()) => {
                if done.send(Ok(())).is_err() {
                    trace!("frame written after its sender left");
                }
            }
            Err(e) => {
                let recorded = fault.get_or_init(|| e.into()).clone();
                warn!(error = %recorded, "frame write failed");
                if done.send(Err(recorded)).is_err() {
                    trace!("write failure had no waiting sender");
                }
                failed.cancel();
                break;
            }
        }
    }

    if let Err(e) = sink.shutdown().await {
        debug!(error = %e, "closing the write half failed");
    }
}

pub(crate) struct Pump {
    source: Box<dyn FrameRead>,
    writer: Arc<FrameWriter>,
    pending: Arc<PendingCalls>,
    dispatcher: Arc<Dispatcher>,
    max_frame_size: usize,
}

impl Pump {
    pub(crate) fn new(
        source: Box<dyn FrameRead>,
        writer: Arc<FrameWriter>,
        pending: Arc<PendingCalls>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let max_frame_size = writer.max_frame_size;
        Self { source, writer, pending, dispatcher, max_frame_size }
    }

    /// Reads, decodes and routes exactly one frame.
    ///
    /// Returns `Err` only for failures that end the connection: a broken or
    /// closed pipe, or a frame whose structure does not decode.
    pub(crate) async fn process_next_message(&mut self) -> Result<(), Fault> {
        let bytes = match self.source.read_frame().await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Err(Fault::new(FaultKind::PeerClosed, "end of stream")),
            Err(TransportError::Closed) => return Err(Fault::new(FaultKind::PeerClosed, "pipe closed")),
            Err(e) => return Err(e.into()),
        };

        // Message-oriented transports have no framing layer to enforce this.
        if bytes.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge { size: bytes.len(), max: self.max_frame_size }.into());
        }

        let frame = match Frame::decode(bytes.clone()) {
            Ok(frame) => frame,
            Err(e) => {
                if let Ok(id) = duowire::peek_call_id(&bytes) {
                    warn!(call_id = id, error = %e, "undecodable frame");
                }
                return Err(Fault::new(FaultKind::Decode, e.to_string()));
            }
        };

        match frame {
            Frame::Request(request) => {
                trace!(call_id = request.id, method = %request.method, "request received");
                let dispatcher = self.dispatcher.clone();
                let writer = self.writer.clone();
                tokio::spawn(async move {
                    let id = request.id;
                    let response = dispatcher.dispatch(request).await;
                    let sent = match writer.send_response(response).await {
                        Err(crate::Error::FrameTooLarge { size, max }) => {
                            let message = format!("result of {} bytes exceeds frame limit of {}", size, max);
                            writer.send_response(CallResponse::failure(id, message)).await
                        }
                        other => other,
                    };
                    if let Err(e) = sent {
                        warn!(call_id = id, error = %e, "failed to send response");
                    }
                });
            }
            Frame::Response(response) => {
                let id = response.id;
                if !self.pending.resolve(id, response.outcome) {
                    trace!(call_id = id, "dropping response with no pending call");
                }
            }
        }

        Ok(())
    }
}
