// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Slave state machine lifecycle tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use apiary_node::error::Error;
use apiary_node::isolate::{Isolate, MockBehavior, MockIsolate};
use apiary_node::manifest::{Manifest, Profile};
use apiary_node::slave::{ChannelDescriptor, Session, SlaveContext, SlaveMachine};
use apiary_protocol::messages::{Invoke, Terminate};
use apiary_protocol::{Frame, MessageType, read_frame, write_frame};
use bytes::Bytes;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

fn manifest() -> Arc<Manifest> {
    let mut manifest: Manifest = serde_json::from_str(
        r#"{"slave": "/usr/bin/test-worker", "endpoint": "/tmp/test-app.sock"}"#,
    )
    .unwrap();
    manifest.name = "echo".to_string();
    Arc::new(manifest)
}

fn fast_profile() -> Profile {
    serde_json::from_str(
        r#"{"startup-timeout": 1, "termination-timeout": 1,
            "heartbeat-timeout": 60, "idle-timeout": 600}"#,
    )
    .unwrap()
}

fn context(isolate: Arc<dyn Isolate>, profile: Profile) -> SlaveContext {
    SlaveContext::new(
        "echo".into(),
        manifest(),
        Arc::new(profile),
        isolate,
        "/tmp/echo.worker".into(),
    )
}

/// Cleanup handler that counts invocations and records the reason.
fn counting_cleanup() -> (
    Box<dyn FnOnce(Error) + Send>,
    Arc<AtomicUsize>,
    Arc<Mutex<Option<Error>>>,
) {
    let count = Arc::new(AtomicUsize::new(0));
    let reason = Arc::new(Mutex::new(None));
    let (count_clone, reason_clone) = (count.clone(), reason.clone());
    let handler = Box::new(move |error: Error| {
        count_clone.fetch_add(1, Ordering::SeqCst);
        *reason_clone.lock().unwrap() = Some(error);
    });
    (handler, count, reason)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Drive a slave to the active state; the returned stream is the worker's
/// side of the control session.
async fn activate(machine: &Arc<SlaveMachine>) -> DuplexStream {
    wait_until(|| machine.state_name() == "handshaking").await;
    let (node_side, worker_side) = tokio::io::duplex(4096);
    machine.activate(Session::from_stream(node_side)).unwrap();
    assert!(machine.active());
    worker_side
}

struct TestChannel {
    /// Write end of the client-to-worker half.
    client: DuplexStream,
    /// Frames the node relays back to the client.
    downstream: mpsc::UnboundedReceiver<Frame>,
    finished: Arc<Mutex<Vec<u64>>>,
}

/// Inject a channel, returning its id and the test-side handles.
fn inject(machine: &Arc<SlaveMachine>, event: &str) -> (u64, TestChannel) {
    let (client, upstream) = tokio::io::duplex(4096);
    let (downstream_tx, downstream) = mpsc::unbounded_channel();
    let finished = Arc::new(Mutex::new(Vec::new()));
    let finished_clone = finished.clone();

    let id = machine
        .inject(
            ChannelDescriptor {
                event: event.into(),
                upstream: Box::new(upstream),
                downstream: downstream_tx,
            },
            Box::new(move |id| finished_clone.lock().unwrap().push(id)),
        )
        .map_err(|(error, _)| error)
        .unwrap();

    (
        id,
        TestChannel {
            client,
            downstream,
            finished,
        },
    )
}

#[tokio::test]
async fn test_spawn_timeout_breaks_the_slave() {
    let isolate = Arc::new(MockIsolate::new(MockBehavior::Pending));
    let (cleanup, count, reason) = counting_cleanup();
    let machine = SlaveMachine::create(context(isolate, fast_profile()), cleanup);

    assert_eq!(machine.state_name(), "spawning");
    assert!(!machine.active());

    wait_until(|| machine.broken()).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(*reason.lock().unwrap(), Some(Error::SpawnTimeout));
}

#[tokio::test]
async fn test_spawn_failure_breaks_the_slave() {
    let isolate = Arc::new(MockIsolate::new(MockBehavior::Fail));
    let (cleanup, count, reason) = counting_cleanup();
    let machine = SlaveMachine::create(context(isolate, fast_profile()), cleanup);

    wait_until(|| machine.broken()).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(matches!(
        reason.lock().unwrap().clone(),
        Some(Error::SpawnFailed(_))
    ));
}

#[tokio::test]
async fn test_handshake_timeout_breaks_the_slave() {
    let isolate = Arc::new(MockIsolate::new(MockBehavior::Ready));
    let (cleanup, count, reason) = counting_cleanup();
    let machine = SlaveMachine::create(context(isolate, fast_profile()), cleanup);

    wait_until(|| machine.state_name() == "handshaking").await;
    // Nobody activates the slave; the startup deadline covers the handshake.
    wait_until(|| machine.broken()).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(*reason.lock().unwrap(), Some(Error::HandshakeTimeout));
}

#[tokio::test]
async fn test_activate_outside_handshaking_is_rejected() {
    let isolate = Arc::new(MockIsolate::new(MockBehavior::Ready));
    let (cleanup, _, _) = counting_cleanup();
    let machine = SlaveMachine::create(context(isolate, fast_profile()), cleanup);

    let _worker = activate(&machine).await;

    // A second activation is illegal in the active state.
    let (node_side, _other) = tokio::io::duplex(64);
    let result = machine.activate(Session::from_stream(node_side));
    assert!(matches!(result, Err(Error::InvalidState)));
    assert!(machine.active());
}

#[tokio::test]
async fn test_happy_path_invoke() {
    let isolate = Arc::new(MockIsolate::new(MockBehavior::Ready));
    let (cleanup, count, _) = counting_cleanup();
    let machine = SlaveMachine::create(context(isolate, fast_profile()), cleanup);

    let worker = activate(&machine).await;
    let (mut worker_read, mut worker_write) = tokio::io::split(worker);
    assert_eq!(machine.load(), 0);

    let (id, mut channel) = inject(&machine, "echo");
    assert_eq!(id, 1);
    assert_eq!(machine.load(), 1);

    // The worker observes the channel opening.
    let frame = read_frame(&mut worker_read).await.unwrap();
    assert_eq!(frame.message_type, MessageType::Invoke);
    assert_eq!(frame.channel, 1);
    let invoke: Invoke = frame.decode_body().unwrap();
    assert_eq!(invoke.event, "echo");

    // Client sends one chunk and half-closes.
    write_frame(&mut channel.client, &Frame::data(0, &b"hi"[..]))
        .await
        .unwrap();
    write_frame(&mut channel.client, &Frame::choke(0))
        .await
        .unwrap();

    // The worker observes them in submission order, on channel 1.
    let frame = read_frame(&mut worker_read).await.unwrap();
    assert_eq!(frame.message_type, MessageType::Chunk);
    assert_eq!(frame.channel, 1);
    assert_eq!(frame.payload.as_ref(), b"hi");
    let frame = read_frame(&mut worker_read).await.unwrap();
    assert_eq!(frame.message_type, MessageType::Choke);
    assert_eq!(frame.channel, 1);

    // The worker echoes and closes its side.
    write_frame(&mut worker_write, &Frame::chunk(1, Bytes::from_static(b"hi")))
        .await
        .unwrap();
    write_frame(&mut worker_write, &Frame::choke(1))
        .await
        .unwrap();

    // The client observes the echo verbatim, then the close.
    let frame = channel.downstream.recv().await.unwrap();
    assert_eq!(frame.message_type, MessageType::Chunk);
    assert_eq!(frame.payload.as_ref(), b"hi");
    let frame = channel.downstream.recv().await.unwrap();
    assert_eq!(frame.message_type, MessageType::Choke);

    // Both sides closed: the handler fired once and the load is back to 0.
    wait_until(|| machine.load() == 0).await;
    wait_until(|| !channel.finished.lock().unwrap().is_empty()).await;
    assert_eq!(*channel.finished.lock().unwrap(), vec![1]);
    assert!(machine.active());
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_channel_ids_are_monotone() {
    let isolate = Arc::new(MockIsolate::new(MockBehavior::Ready));
    let (cleanup, _, _) = counting_cleanup();
    let machine = SlaveMachine::create(context(isolate, fast_profile()), cleanup);
    let _worker = activate(&machine).await;

    let (first, _one) = inject(&machine, "echo");
    let (second, _two) = inject(&machine, "echo");
    assert_eq!(first, 1);
    assert_eq!(second, 2);
    assert_eq!(machine.load(), 2);
}

#[tokio::test]
async fn test_close_tx_then_rx() {
    let isolate = Arc::new(MockIsolate::new(MockBehavior::Ready));
    let (cleanup, _, _) = counting_cleanup();
    let machine = SlaveMachine::create(context(isolate, fast_profile()), cleanup);
    let worker = activate(&machine).await;
    let (mut worker_read, mut worker_write) = tokio::io::split(worker);

    let (id, mut channel) = inject(&machine, "echo");
    let _ = read_frame(&mut worker_read).await.unwrap(); // invoke

    // tx side closes first.
    write_frame(&mut channel.client, &Frame::choke(0))
        .await
        .unwrap();
    let frame = read_frame(&mut worker_read).await.unwrap();
    assert_eq!(frame.message_type, MessageType::Choke);

    // Half-closed: the handler has not fired yet.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(machine.load(), 1);
    assert!(channel.finished.lock().unwrap().is_empty());

    // rx side closes second.
    write_frame(&mut worker_write, &Frame::choke(id))
        .await
        .unwrap();
    let frame = channel.downstream.recv().await.unwrap();
    assert_eq!(frame.message_type, MessageType::Choke);

    wait_until(|| machine.load() == 0).await;
    assert_eq!(*channel.finished.lock().unwrap(), vec![id]);
}

#[tokio::test]
async fn test_close_rx_then_tx() {
    let isolate = Arc::new(MockIsolate::new(MockBehavior::Ready));
    let (cleanup, _, _) = counting_cleanup();
    let machine = SlaveMachine::create(context(isolate, fast_profile()), cleanup);
    let worker = activate(&machine).await;
    let (mut worker_read, mut worker_write) = tokio::io::split(worker);

    let (id, mut channel) = inject(&machine, "echo");
    let _ = read_frame(&mut worker_read).await.unwrap(); // invoke

    // rx side closes first.
    write_frame(&mut worker_write, &Frame::choke(id))
        .await
        .unwrap();
    let frame = channel.downstream.recv().await.unwrap();
    assert_eq!(frame.message_type, MessageType::Choke);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(machine.load(), 1);
    assert!(channel.finished.lock().unwrap().is_empty());

    // tx side closes second.
    write_frame(&mut channel.client, &Frame::choke(0))
        .await
        .unwrap();

    wait_until(|| machine.load() == 0).await;
    assert_eq!(*channel.finished.lock().unwrap(), vec![id]);
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let isolate = Arc::new(MockIsolate::new(MockBehavior::Ready));
    let (cleanup, count, reason) = counting_cleanup();
    let machine = SlaveMachine::create(context(isolate, fast_profile()), cleanup);
    let _worker = activate(&machine).await;

    machine.shutdown(Error::WorkerDisconnected);
    machine.shutdown(Error::SpawnTimeout);
    machine.shutdown(Error::WorkerDisconnected);

    assert!(machine.broken());
    // Only the first call had effect.
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(*reason.lock().unwrap(), Some(Error::WorkerDisconnected));
}

#[tokio::test]
async fn test_terminate_is_graceful_and_suppresses_cleanup() {
    let isolate = Arc::new(MockIsolate::new(MockBehavior::Ready));
    let (cleanup, count, _) = counting_cleanup();
    let machine = SlaveMachine::create(context(isolate, fast_profile()), cleanup);
    let worker = activate(&machine).await;
    let (mut worker_read, _worker_write) = tokio::io::split(worker);

    machine.terminate(Error::Shutdown);
    machine.terminate(Error::Shutdown);
    assert_eq!(machine.state_name(), "terminating");

    // The worker receives the terminate request...
    let frame = read_frame(&mut worker_read).await.unwrap();
    assert_eq!(frame.message_type, MessageType::Terminate);
    let terminate: Terminate = frame.decode_body().unwrap();
    assert_eq!(terminate.code, "SHUTDOWN");

    // ...and exits; the session closes.
    drop(worker_read);
    drop(_worker_write);

    wait_until(|| machine.broken()).await;
    // The cleanup callback is suppressed after terminate.
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_termination_timeout_reaps_a_stuck_worker() {
    let isolate = Arc::new(MockIsolate::new(MockBehavior::Ready));
    let (cleanup, count, _) = counting_cleanup();
    let machine = SlaveMachine::create(context(isolate, fast_profile()), cleanup);
    let _worker = activate(&machine).await;

    machine.terminate(Error::Shutdown);
    assert_eq!(machine.state_name(), "terminating");

    // The worker never exits; the termination deadline reaps it.
    wait_until(|| machine.broken()).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_terminate_races_an_output_error() {
    let isolate = Arc::new(MockIsolate::new(MockBehavior::Ready));
    let (cleanup, count, _) = counting_cleanup();
    let machine = SlaveMachine::create(context(isolate, fast_profile()), cleanup);
    let _worker = activate(&machine).await;

    // Both a graceful terminate and a hard breakage at the same instant:
    // exactly one transition wins, and the cleanup callback stays
    // suppressed because terminate was requested.
    machine.terminate(Error::Shutdown);
    machine.shutdown(Error::OutputReadFailed("device gone".into()));

    wait_until(|| machine.broken()).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_terminating_drains_open_channels() {
    let isolate = Arc::new(MockIsolate::new(MockBehavior::Ready));
    let (cleanup, _, _) = counting_cleanup();
    let machine = SlaveMachine::create(context(isolate, fast_profile()), cleanup);
    let worker = activate(&machine).await;
    let (mut worker_read, _worker_write) = tokio::io::split(worker);

    let (id, mut channel) = inject(&machine, "echo");
    let _ = read_frame(&mut worker_read).await.unwrap(); // invoke
    assert_eq!(machine.load(), 1);

    machine.terminate(Error::Shutdown);

    // The channel was released and its handler fired exactly once.
    wait_until(|| !channel.finished.lock().unwrap().is_empty()).await;
    assert_eq!(*channel.finished.lock().unwrap(), vec![id]);
    assert_eq!(machine.load(), 0);

    // The client was told about the breakage.
    let frame = channel.downstream.recv().await.unwrap();
    assert_eq!(frame.message_type, MessageType::Error);
}

#[tokio::test]
async fn test_inject_into_inactive_slave_is_rejected() {
    let isolate = Arc::new(MockIsolate::new(MockBehavior::Pending));
    let (cleanup, _, _) = counting_cleanup();
    let machine = SlaveMachine::create(context(isolate, fast_profile()), cleanup);

    let (_client, upstream) = tokio::io::duplex(64);
    let (downstream, _rx) = mpsc::unbounded_channel();
    let result = machine.inject(
        ChannelDescriptor {
            event: "echo".into(),
            upstream: Box::new(upstream),
            downstream,
        },
        Box::new(|_| {}),
    );

    match result {
        Err((error, descriptor)) => {
            assert_eq!(error, Error::SlaveNotActive);
            // The descriptor comes back so the invocation can be restored.
            assert_eq!(descriptor.event, "echo");
        }
        Ok(_) => panic!("inject must fail while spawning"),
    }
    assert_eq!(machine.load(), 0);
}

#[tokio::test]
async fn test_worker_disconnect_breaks_the_slave() {
    let isolate = Arc::new(MockIsolate::new(MockBehavior::Ready));
    let (cleanup, count, reason) = counting_cleanup();
    let machine = SlaveMachine::create(context(isolate, fast_profile()), cleanup);

    let worker = activate(&machine).await;
    drop(worker);

    wait_until(|| machine.broken()).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(*reason.lock().unwrap(), Some(Error::WorkerDisconnected));
}

#[tokio::test]
async fn test_silent_worker_is_disconnected() {
    let isolate = Arc::new(MockIsolate::new(MockBehavior::Ready));
    let profile: Profile = serde_json::from_str(
        r#"{"startup-timeout": 5, "termination-timeout": 1, "heartbeat-timeout": 1}"#,
    )
    .unwrap();
    let (cleanup, count, reason) = counting_cleanup();
    let machine = SlaveMachine::create(context(isolate, profile), cleanup);

    // The worker connects but never sends a frame.
    let _worker = activate(&machine).await;

    wait_until(|| machine.broken()).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(*reason.lock().unwrap(), Some(Error::WorkerDisconnected));
}

#[tokio::test]
async fn test_heartbeats_keep_the_worker_alive() {
    let isolate = Arc::new(MockIsolate::new(MockBehavior::Ready));
    let profile: Profile = serde_json::from_str(
        r#"{"startup-timeout": 5, "termination-timeout": 1, "heartbeat-timeout": 1}"#,
    )
    .unwrap();
    let (cleanup, _, _) = counting_cleanup();
    let machine = SlaveMachine::create(context(isolate, profile), cleanup);

    let worker = activate(&machine).await;
    let (_worker_read, mut worker_write) = tokio::io::split(worker);

    for _ in 0..4 {
        write_frame(&mut worker_write, &Frame::heartbeat())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
    }
    assert!(machine.active());
}

#[tokio::test]
async fn test_idle_slave_retires_itself() {
    let isolate = Arc::new(MockIsolate::new(MockBehavior::Ready));
    let profile: Profile = serde_json::from_str(
        r#"{"startup-timeout": 5, "termination-timeout": 1,
            "heartbeat-timeout": 60, "idle-timeout": 1}"#,
    )
    .unwrap();
    let (cleanup, count, reason) = counting_cleanup();
    let machine = SlaveMachine::create(context(isolate, profile), cleanup);

    let worker = activate(&machine).await;
    let (mut worker_read, _worker_write) = tokio::io::split(worker);

    // No channels arrive; once the idle timeout elapses the slave asks its
    // worker to terminate gracefully.
    let frame = read_frame(&mut worker_read).await.unwrap();
    assert_eq!(frame.message_type, MessageType::Terminate);
    let terminate: Terminate = frame.decode_body().unwrap();
    assert_eq!(terminate.code, "IDLE_SHUTDOWN");
    assert_eq!(machine.state_name(), "terminating");

    // The worker exits; the retirement is reported through the cleanup
    // handler so the pool can drop the slave.
    drop(worker_read);
    drop(_worker_write);
    wait_until(|| machine.broken()).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(*reason.lock().unwrap(), Some(Error::IdleShutdown));
}

#[tokio::test]
async fn test_worker_output_is_retained() {
    let isolate = Arc::new(MockIsolate::new(MockBehavior::Ready));
    let (cleanup, _, _) = counting_cleanup();
    let machine = SlaveMachine::create(context(isolate.clone(), fast_profile()), cleanup);

    wait_until(|| machine.state_name() == "handshaking").await;
    let mut outputs = isolate.take_outputs();
    let mut feed = outputs.pop().unwrap();

    use tokio::io::AsyncWriteExt;
    feed.write_all(b"booting\nready\n").await.unwrap();

    wait_until(|| machine.output_tail().len() == 2).await;
    assert_eq!(machine.output_tail(), vec!["booting", "ready"]);
}
