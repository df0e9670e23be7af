//! Unit tests for the pending table, dispatcher, framing and state cell.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use anyhow::Context;
use bytes::Bytes;
use duowire::CallRequest;
use duowire::CallResponse;
use duowire::Channel;
use duowire::Codec;
use duowire::Frame;
use duowire::JsonCodec;
use duowire::StandardConverter;
use duowire::TypeDesc;
use duowire::Value;
use serde_json::json;
use tokio::io::AsyncWriteExt;

use crate::connection::ReadLoop;
use crate::contract::Args;
use crate::contract::Contract;
use crate::contract::Invocable;
use crate::contract::MethodSig;
use crate::dispatch::Dispatcher;
use crate::endpoint::WeakEndpoint;
use crate::error::Error;
use crate::error::Fault;
use crate::error::FaultKind;
use crate::framed::LengthDelimited;
use crate::memory::MemoryTransport;
use crate::pending::PendingCalls;
use crate::state::ConnectionState;
use crate::state::StateCell;
use crate::stream::FrameWriter;
use crate::stream::Pump;
use crate::transport::FrameRead;
use crate::transport::FrameWrite;
use crate::transport::Transport;
use crate::transport::TransportError;

// ============================================================================
//  PENDING-CALL TABLE
// ============================================================================

#[tokio::test]
async fn test_pending_ids_are_unique_and_resolve_once() {
    let pending = PendingCalls::new();
    let (a, rx_a) = pending.register().unwrap();
    let (b, _rx_b) = pending.register().unwrap();
    assert_ne!(a, b);
    assert_eq!(pending.len(), 2);

    assert!(pending.resolve(a, Ok(Bytes::from_static(b"1"))));
    assert!(!pending.resolve(a, Ok(Bytes::from_static(b"2"))), "second resolution must be refused");

    let got = rx_a.await.unwrap().unwrap();
    assert_eq!(got, Ok(Bytes::from_static(b"1")));
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn test_pending_concurrent_resolution_has_one_winner() {
    let pending = Arc::new(PendingCalls::new());
    let (id, rx) = pending.register().unwrap();
    let winners = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..32u8 {
        let pending = pending.clone();
        let winners = winners.clone();
        tasks.push(tokio::spawn(async move {
            let won = if i % 2 == 0 {
                pending.resolve(id, Ok(Bytes::from(vec![i])))
            } else {
                pending.cancel(id)
            };
            if won {
                winners.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(pending.len(), 0);
    // Either a value arrived or the entry was canceled and the sender dropped.
    let _ = rx.await;
}

#[tokio::test]
async fn test_pending_fail_all_seals_table() {
    let pending = PendingCalls::new();
    let receivers: Vec<_> = (0..5).map(|_| pending.register().unwrap().1).collect();

    let fault = Fault::new(FaultKind::PeerClosed, "gone");
    pending.fail_all(Error::Fault(fault.clone()));

    for rx in receivers {
        match rx.await.unwrap() {
            Err(Error::Fault(f)) => assert_eq!(f, fault),
            other => panic!("expected fault, got {:?}", other),
        }
    }
    assert_eq!(pending.len(), 0);
    assert!(matches!(pending.register(), Err(Error::Fault(_))));
}

#[tokio::test]
async fn test_pending_cancel_then_resolve_is_dropped() {
    let pending = PendingCalls::new();
    let (id, rx) = pending.register().unwrap();
    assert!(pending.cancel(id));
    assert!(!pending.resolve(id, Ok(Bytes::new())));
    assert!(rx.await.is_err(), "sender is gone without a value");
}

// ============================================================================
//  DISPATCHER
// ============================================================================

struct Calc {
    offset: i64,
}

fn calc_contract(instantiations: Arc<AtomicUsize>) -> Contract {
    Contract::builder("Calc", || Some(Calc { offset: 0 }))
        .method(
            MethodSig::new("Add").param("a", TypeDesc::I64).param("b", TypeDesc::I64),
            Invocable::sync(|calc: &Calc, args: Args| {
                let a: i64 = args.get(0)?;
                let b: i64 = args.get(1)?;
                Ok(a + b + calc.offset)
            }),
        )
        .method(
            MethodSig::new("Add").param("a", TypeDesc::I64).param("b", TypeDesc::I64).param("c", TypeDesc::I64),
            Invocable::sync(|_: &Calc, args: Args| {
                Ok(args.get::<i64>(0)? + args.get::<i64>(1)? + args.get::<i64>(2)?)
            }),
        )
        .method(
            MethodSig::new("Fail"),
            Invocable::new(|_: Arc<Calc>, _args: Args| async move {
                let inner: anyhow::Result<()> = Err(anyhow::anyhow!("disk on fire"));
                inner.context("while saving")?;
                anyhow::Ok(())
            }),
        )
        .method(
            MethodSig::new("Boom"),
            Invocable::sync(|_: &Calc, _args: Args| -> anyhow::Result<()> { panic!("boom") }),
        )
        .generic_method(
            MethodSig::new("Echo").generic("T").param("value", TypeDesc::named("T")),
            move |witnesses: &[TypeDesc]| {
                instantiations.fetch_add(1, Ordering::SeqCst);
                // Only scalars are supported.
                if matches!(witnesses.first(), Some(TypeDesc::List(_))) {
                    return None;
                }
                Some(Invocable::sync(|_: &Calc, args: Args| {
                    Ok(args.value(0).cloned().unwrap_or(Value::Null))
                }))
            },
        )
        .build()
}

fn dispatcher(contract: Option<Contract>) -> Dispatcher {
    Dispatcher::new(
        contract.map(Arc::new),
        Channel::Service,
        Arc::new(JsonCodec),
        Arc::new(StandardConverter),
        WeakEndpoint::detached(),
    )
}

fn request(method: &str, args: &[Value], witnesses: &[TypeDesc]) -> CallRequest {
    CallRequest {
        id: 7,
        channel: Channel::Service,
        method: method.to_string(),
        args: args
            .iter()
            .map(|v| Bytes::from(JsonCodec.encode_value(v).unwrap()))
            .collect(),
        witnesses: witnesses.iter().map(ToString::to_string).collect(),
    }
}

fn success(response: CallResponse) -> Value {
    assert_eq!(response.id, 7);
    let bytes = response.outcome.unwrap_or_else(|e| panic!("call failed: {}", e));
    JsonCodec.decode_value(&bytes).unwrap()
}

fn failure(response: CallResponse) -> String {
    assert_eq!(response.id, 7);
    response.outcome.expect_err("call should have failed")
}

#[tokio::test]
async fn test_dispatch_invokes_by_name_and_arity() {
    let d = dispatcher(Some(calc_contract(Arc::default())));
    assert_eq!(success(d.dispatch(request("Add", &[json!(2), json!(3)], &[])).await), json!(5));
    assert_eq!(
        success(d.dispatch(request("Add", &[json!(1), json!(2), json!(3)], &[])).await),
        json!(6)
    );
}

#[tokio::test]
async fn test_dispatch_resolution_failures() {
    let d = dispatcher(Some(calc_contract(Arc::default())));

    let msg = failure(d.dispatch(request("Foo", &[], &[])).await);
    assert_eq!(msg, "method not found: Foo");

    let msg = failure(d.dispatch(request("Add", &[json!(1)], &[])).await);
    assert_eq!(msg, "parameter mismatch: Add takes 2 or 3 arguments, got 1");

    let msg = failure(d.dispatch(request("Echo", &[json!(1)], &[])).await);
    assert_eq!(msg, "generic arguments mismatch: Echo takes 1 type arguments, got 0");

    let msg = failure(d.dispatch(request("Add", &[json!(1), json!("two")], &[])).await);
    assert_eq!(msg, "cannot convert parameter 'b' from string to i64");
}

#[tokio::test]
async fn test_dispatch_without_contract_or_instance() {
    let msg = failure(dispatcher(None).dispatch(request("Add", &[], &[])).await);
    assert_eq!(msg, "no handler registered for contract");

    // A contract served on the other channel does not answer.
    let mut wrong_channel = request("Add", &[json!(1), json!(2)], &[]);
    wrong_channel.channel = Channel::Callback;
    let d = dispatcher(Some(calc_contract(Arc::default())));
    assert_eq!(failure(d.dispatch(wrong_channel).await), "no handler registered for contract");

    let empty = Contract::builder("Empty", || None::<Calc>).build();
    let msg = failure(dispatcher(Some(empty)).dispatch(request("Add", &[], &[])).await);
    assert_eq!(msg, "handler factory returned no instance");
}

#[tokio::test]
async fn test_dispatch_factory_runs_per_request() {
    let made = Arc::new(AtomicUsize::new(0));
    let counter = made.clone();
    let contract = Contract::builder("Counter", move || {
        Some(Calc { offset: counter.fetch_add(1, Ordering::SeqCst) as i64 * 100 })
    })
    .method(
        MethodSig::new("Offset"),
        Invocable::sync(|calc: &Calc, _args: Args| Ok(calc.offset)),
    )
    .build();

    let d = dispatcher(Some(contract));
    assert_eq!(success(d.dispatch(request("Offset", &[], &[])).await), json!(0));
    assert_eq!(success(d.dispatch(request("Offset", &[], &[])).await), json!(100));
    assert_eq!(made.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_dispatch_generic_converts_through_witness() {
    let instantiations = Arc::new(AtomicUsize::new(0));
    let d = dispatcher(Some(calc_contract(instantiations.clone())));

    let v = success(d.dispatch(request("Echo", &[json!("5")], &[TypeDesc::I32])).await);
    assert_eq!(v, json!(5));

    // Same witness hits the cache.
    let v = success(d.dispatch(request("Echo", &[json!(6.0)], &[TypeDesc::I32])).await);
    assert_eq!(v, json!(6));
    assert_eq!(instantiations.load(Ordering::SeqCst), 1);

    let v = success(d.dispatch(request("Echo", &[json!(6)], &[TypeDesc::String])).await);
    assert_eq!(v, json!("6"));
    assert_eq!(instantiations.load(Ordering::SeqCst), 2);

    let msg = failure(d.dispatch(request("Echo", &[json!("x")], &[TypeDesc::I32])).await);
    assert_eq!(msg, "cannot convert parameter 'value' from string to i32");
}

#[tokio::test]
async fn test_dispatch_generic_refused_witness() {
    let d = dispatcher(Some(calc_contract(Arc::default())));
    let witness = TypeDesc::list(TypeDesc::I32);
    let msg = failure(d.dispatch(request("Echo", &[json!([1])], &[witness])).await);
    assert_eq!(msg, "Echo cannot be instantiated with <list<i32>>");
}

#[tokio::test]
async fn test_dispatch_unreadable_witness_fails_only_the_call() {
    let d = dispatcher(Some(calc_contract(Arc::default())));

    for text in ["list", "", "a b"] {
        let mut req = request("Echo", &[json!(1)], &[TypeDesc::I32]);
        req.witnesses = vec![text.to_string()];
        let msg = failure(d.dispatch(req).await);
        assert!(msg.starts_with("invalid type argument: "), "{:?}: {}", text, msg);
    }

    let mut req = request("Echo", &[json!(1)], &[]);
    req.witnesses = vec![format!("{}i32{}", "list<".repeat(10_000), ">".repeat(10_000))];
    let msg = failure(d.dispatch(req).await);
    assert!(msg.contains("nesting"), "{}", msg);

    assert_eq!(success(d.dispatch(request("Echo", &[json!(1)], &[TypeDesc::I64])).await), json!(1));
}

#[tokio::test]
async fn test_generic_instantiation_is_cached_per_witness_set() {
    let contract = calc_contract(Arc::default());
    let echo = &contract.overloads("Echo").unwrap()[0];
    assert_eq!(echo.binding.cached_instantiations(), 0);
    assert!(echo.binding.resolve(&[TypeDesc::I64]).is_some());
    assert!(echo.binding.resolve(&[TypeDesc::I64]).is_some());
    assert!(echo.binding.resolve(&[TypeDesc::Bool]).is_some());
    assert!(echo.binding.resolve(&[TypeDesc::list(TypeDesc::Bool)]).is_none());
    assert_eq!(echo.binding.cached_instantiations(), 2);
}

#[tokio::test]
async fn test_dispatch_handler_errors_and_panics_become_failures() {
    let d = dispatcher(Some(calc_contract(Arc::default())));

    let msg = failure(d.dispatch(request("Fail", &[], &[])).await);
    assert!(msg.contains("while saving"), "{}", msg);
    assert!(msg.contains("disk on fire"), "full chain expected: {}", msg);

    let msg = failure(d.dispatch(request("Boom", &[], &[])).await);
    assert_eq!(msg, "handler panicked: boom");

    // The dispatcher is still usable afterwards.
    assert_eq!(success(d.dispatch(request("Add", &[json!(1), json!(1)], &[])).await), json!(2));
}

#[tokio::test]
async fn test_dispatch_undecodable_argument_fails_only_the_call() {
    let d = dispatcher(Some(calc_contract(Arc::default())));
    let mut req = request("Add", &[json!(1), json!(2)], &[]);
    req.args[1] = Bytes::from_static(b"{nope");
    let msg = failure(d.dispatch(req).await);
    assert!(msg.starts_with("cannot decode parameter 'b'"), "{}", msg);
}

// ============================================================================
//  LENGTH-DELIMITED FRAMING
// ============================================================================

#[tokio::test]
async fn test_length_delimited_roundtrip_and_clean_eof() {
    let (a, b) = tokio::io::duplex(64);
    let (_ra, mut wa) = Box::new(LengthDelimited::new(a, 1024)).split();
    let (mut rb, _wb) = Box::new(LengthDelimited::new(b, 1024)).split();

    // Larger than the duplex buffer, so the reader must reassemble it.
    let big = Bytes::from(vec![7u8; 300]);
    wa.write_frame(Bytes::from_static(b"hello")).await.unwrap();
    wa.write_frame(Bytes::new()).await.unwrap();
    let writer = tokio::spawn({
        let big = big.clone();
        async move {
            wa.write_frame(big).await.unwrap();
            wa.shutdown().await.unwrap();
        }
    });

    assert_eq!(rb.read_frame().await.unwrap(), Some(Bytes::from_static(b"hello")));
    assert_eq!(rb.read_frame().await.unwrap(), Some(Bytes::new()));
    assert_eq!(rb.read_frame().await.unwrap(), Some(big));
    assert_eq!(rb.read_frame().await.unwrap(), None);
    writer.await.unwrap();
}

#[tokio::test]
async fn test_length_delimited_limits_and_truncation() {
    let (a, b) = tokio::io::duplex(64);
    let (_ra, mut wa) = Box::new(LengthDelimited::new(a, 4)).split();
    assert!(matches!(
        wa.write_frame(Bytes::from_static(b"too long")).await,
        Err(TransportError::FrameTooLarge { size: 8, max: 4 })
    ));

    // Raw writer announcing a frame bigger than the reader allows.
    let (mut raw, other) = tokio::io::duplex(64);
    let (mut reader, _w) = Box::new(LengthDelimited::new(other, 4)).split();
    raw.write_all(&100u32.to_be_bytes()).await.unwrap();
    assert!(matches!(
        reader.read_frame().await,
        Err(TransportError::FrameTooLarge { size: 100, max: 4 })
    ));

    // Stream ends halfway through a payload.
    let (mut raw, other) = tokio::io::duplex(64);
    let (mut reader, _w) = Box::new(LengthDelimited::new(other, 1024)).split();
    raw.write_all(&10u32.to_be_bytes()).await.unwrap();
    raw.write_all(b"abc").await.unwrap();
    drop(raw);
    match reader.read_frame().await {
        Err(TransportError::Io(msg)) => assert!(msg.contains("inside frame payload"), "{}", msg),
        other => panic!("expected truncation error, got {:?}", other),
    }
    drop(b);
}

// ============================================================================
//  STATE CELL
// ============================================================================

#[tokio::test]
async fn test_state_open_happens_once() {
    let cell = StateCell::new();
    assert_eq!(cell.get(), ConnectionState::NotOpened);
    assert!(cell.begin_open().is_ok());
    assert_eq!(cell.begin_open(), Err(ConnectionState::Connecting));
}

#[tokio::test]
async fn test_state_terminal_is_sticky() {
    let cell = StateCell::new();
    cell.begin_open().unwrap();
    assert!(cell.transition(ConnectionState::Connected));
    assert!(cell.transition(ConnectionState::Closed));
    assert!(!cell.fail(Fault::new(FaultKind::Io, "late")));
    assert!(!cell.transition(ConnectionState::Connected));
    assert_eq!(cell.get(), ConnectionState::Closed);
    assert!(cell.wait_terminal().await.is_ok());
}

#[tokio::test]
async fn test_state_waiters_all_observe_fault() {
    let cell = Arc::new(StateCell::new());
    cell.begin_open().unwrap();
    cell.transition(ConnectionState::Connected);

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait_terminal().await })
        })
        .collect();
    tokio::task::yield_now().await;

    cell.fail(Fault::new(FaultKind::Decode, "bad frame"));
    for w in waiters {
        let fault = w.await.unwrap().unwrap_err();
        assert_eq!(fault.kind, FaultKind::Decode);
    }
    // Already terminal: returns at once.
    assert!(cell.wait_terminal().await.is_err());
}

// ============================================================================
//  PUMP AND READ LOOP
// ============================================================================

struct Harness {
    pump: Pump,
    pending: Arc<PendingCalls>,
    writer: Arc<FrameWriter>,
    peer: MemoryTransport,
}

fn harness() -> Harness {
    let (local, peer) = MemoryTransport::pair();
    let (source, sink) = Box::new(local).split();
    let writer = Arc::new(FrameWriter::new(sink, 1024));
    let pending = Arc::new(PendingCalls::new());
    let pump = Pump::new(
        source,
        writer.clone(),
        pending.clone(),
        Arc::new(dispatcher(Some(calc_contract(Arc::default())))),
    );
    Harness { pump, pending, writer, peer }
}

#[tokio::test]
async fn test_pump_routes_responses_and_drops_strays() {
    let h = harness();
    let Harness { mut pump, pending, peer, .. } = h;
    let (_peer_rx, mut peer_tx) = Box::new(peer).split();

    let (id, rx) = pending.register().unwrap();
    let stray = Frame::Response(CallResponse::success(id + 100, Bytes::from_static(b"0")));
    peer_tx.write_frame(stray.encode().unwrap()).await.unwrap();
    let real = Frame::Response(CallResponse::success(id, Bytes::from_static(b"42")));
    peer_tx.write_frame(real.encode().unwrap()).await.unwrap();

    pump.process_next_message().await.unwrap();
    assert_eq!(pending.len(), 1, "stray response must not touch the table");
    pump.process_next_message().await.unwrap();
    assert_eq!(rx.await.unwrap().unwrap(), Ok(Bytes::from_static(b"42")));
}

#[tokio::test]
async fn test_pump_answers_requests_with_same_id() {
    let Harness { mut pump, peer, .. } = harness();
    let (mut peer_rx, mut peer_tx) = Box::new(peer).split();

    let mut req = request("Add", &[json!(20), json!(22)], &[]);
    req.id = 99;
    peer_tx.write_frame(Frame::Request(req).encode().unwrap()).await.unwrap();
    pump.process_next_message().await.unwrap();

    let reply = peer_rx.read_frame().await.unwrap().unwrap();
    match Frame::decode(reply).unwrap() {
        Frame::Response(resp) => {
            assert_eq!(resp.id, 99);
            assert_eq!(resp.outcome, Ok(Bytes::from_static(b"42")));
        }
        other => panic!("expected response, got {:?}", other),
    }
}

#[tokio::test]
async fn test_pump_faults_on_garbage_and_eof() {
    let Harness { mut pump, peer, .. } = harness();
    let (_peer_rx, mut peer_tx) = Box::new(peer).split();

    peer_tx.write_frame(Bytes::from_static(&[0xff, 1, 2])).await.unwrap();
    let fault = pump.process_next_message().await.unwrap_err();
    assert_eq!(fault.kind, FaultKind::Decode);

    peer_tx.shutdown().await.unwrap();
    let fault = pump.process_next_message().await.unwrap_err();
    assert_eq!(fault.kind, FaultKind::PeerClosed);
}

#[tokio::test]
async fn test_read_loop_cancel_closes_and_cancels_pending() {
    let Harness { pump, pending, writer, peer } = harness();
    let state = Arc::new(StateCell::new());
    state.begin_open().unwrap();
    state.transition(ConnectionState::Connected);

    let (_id, rx) = pending.register().unwrap();
    let cancel = tokio_util::sync::CancellationToken::new();
    let task = tokio::spawn(
        ReadLoop {
            endpoint: "test".to_string(),
            pump,
            state: state.clone(),
            pending: pending.clone(),
            writer: writer.clone(),
            cancel: cancel.clone(),
        }
        .run(),
    );

    cancel.cancel();
    task.await.unwrap();
    assert_eq!(state.get(), ConnectionState::Closed);
    assert!(matches!(rx.await.unwrap(), Err(Error::Canceled)));
    assert!(matches!(pending.register(), Err(Error::Canceled)));

    // Writer was shut down on the way out.
    let req = request("Add", &[], &[]);
    assert!(matches!(writer.send_request(req).await, Err(Error::Canceled)));
    drop(peer);
}

#[tokio::test]
async fn test_frame_writer_rejects_oversized_frames_without_writing() {
    let Harness { writer, peer, .. } = harness();
    let (mut peer_rx, _peer_tx) = Box::new(peer).split();

    let big = request("Add", &[json!("x".repeat(2048))], &[]);
    assert!(matches!(writer.send_request(big).await, Err(Error::FrameTooLarge { max: 1024, .. })));

    writer.send_request(request("Add", &[], &[])).await.unwrap();
    let frame = Frame::decode(peer_rx.read_frame().await.unwrap().unwrap()).unwrap();
    assert!(matches!(frame, Frame::Request(r) if r.args.is_empty()));
}
