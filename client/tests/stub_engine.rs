//! End-to-end tests against an in-process stub peer speaking the wire
//! protocol.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cryptmux_client::{
    ChannelMode, DataCallbacks, DataObject, Error, EventEngine, FdTable, OperationContext,
    PassphraseProvider, Request, Role, Transport, TransportState,
};
use cryptmux_common::platform_io::create_pipe;
use cryptmux_common::protocol::MAX_LINE_LEN;

const DEADLINE: Option<Duration> = Some(Duration::from_secs(5));

/// Run a scripted acceptor on its own thread, handing the initiator end
/// back to the test.
fn scripted_peer(
    mode: ChannelMode,
    script: impl FnOnce(&mut Transport) + Send + 'static,
) -> (Transport, thread::JoinHandle<()>) {
    let (theirs, ours) = UnixStream::pair().unwrap();
    let peer = thread::spawn(move || {
        let mut transport = Transport::from_stream(theirs, Role::Acceptor, mode).unwrap();
        script(&mut transport);
    });
    let initiator = Transport::from_stream(ours, Role::Initiator, mode).unwrap();
    (initiator, peer)
}

fn engine_pair() -> (Arc<FdTable>, EventEngine) {
    let table = Arc::new(FdTable::new());
    let engine = EventEngine::new(table.clone());
    (table, engine)
}

#[test]
fn inline_data_cycle_decodes_to_hello() -> anyhow::Result<()> {
    let (initiator, peer) = scripted_peer(ChannelMode::Duplex, |t| {
        match t.recv_request().unwrap() {
            Request::Command { name, .. } => assert_eq!(name, "TEST"),
            other => panic!("stub expected a command, got {other:?}"),
        }
        t.send_data(b"aGVsbG8=").unwrap();
        t.send_ok(None).unwrap();
    });

    let (table, engine) = engine_pair();
    let mut ctx = OperationContext::new(initiator, table);
    ctx.bind_response_sink(DataObject::empty());
    ctx.submit("TEST")?;
    ctx.wait(&engine, DEADLINE)?;

    let chunk = ctx
        .take_response_sink()
        .and_then(DataObject::into_bytes)
        .expect("response sink should be reclaimable after completion");
    assert_eq!(chunk, b"aGVsbG8=");
    assert_eq!(BASE64.decode(&chunk)?, b"hello");

    assert_eq!(ctx.transport().lock().unwrap().state(), TransportState::Ready);
    peer.join().unwrap();
    Ok(())
}

#[test]
fn one_shot_transport_is_exhausted_after_one_cycle() -> anyhow::Result<()> {
    let (initiator, peer) = scripted_peer(ChannelMode::OneShot, |t| {
        t.recv_request().unwrap();
        t.send_ok(Some("single cycle served")).unwrap();
    });

    let (table, engine) = engine_pair();
    let mut ctx = OperationContext::new(initiator, table);
    ctx.submit("NOP")?;
    ctx.wait(&engine, DEADLINE)?;
    peer.join().unwrap();

    let transport = ctx.transport();
    let err = transport.lock().unwrap().send_command("NOP").unwrap_err();
    assert!(matches!(err, Error::ChannelExhausted));
    Ok(())
}

#[test]
fn over_long_peer_line_poisons_the_transport() -> anyhow::Result<()> {
    let (theirs, ours) = UnixStream::pair()?;
    let peer = thread::spawn(move || {
        (&theirs).write_all(b"OK rogue peer ready\n").unwrap();
        // Never terminate the line: the client must refuse it rather than
        // truncate.
        let garbage = vec![b'z'; MAX_LINE_LEN + 100];
        (&theirs).write_all(&garbage).unwrap();
        // Hold the socket open until the client has failed the transport.
        thread::sleep(Duration::from_millis(500));
    });
    let initiator = Transport::from_stream(ours, Role::Initiator, ChannelMode::Duplex)?;

    let (table, engine) = engine_pair();
    let mut ctx = OperationContext::new(initiator, table);
    ctx.submit("NOP")?;
    let err = ctx.wait(&engine, DEADLINE).unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation(_)));

    let transport = ctx.transport();
    let mut transport = transport.lock().unwrap();
    assert_eq!(transport.state(), TransportState::Failed);
    let err = transport.send_command("NOP").unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation(_)));
    drop(transport);
    peer.join().unwrap();
    Ok(())
}

#[test]
fn peer_disconnect_mid_cycle_is_peer_closed() -> anyhow::Result<()> {
    let (initiator, peer) = scripted_peer(ChannelMode::Duplex, |t| {
        t.recv_request().unwrap();
        // Vanish without a terminal line.
    });

    let (table, engine) = engine_pair();
    let mut ctx = OperationContext::new(initiator, table);
    ctx.submit("NOP")?;
    let err = ctx.wait(&engine, DEADLINE).unwrap_err();
    assert!(matches!(err, Error::PeerClosed));
    peer.join().unwrap();
    Ok(())
}

struct RecordingProvider {
    calls:  Arc<Mutex<Vec<(String, String, bool)>>>,
    answer: Option<String>,
}

impl PassphraseProvider for RecordingProvider {
    fn passphrase(
        &mut self,
        hint: &str,
        description: &str,
        retry: bool,
    ) -> cryptmux_common::Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((hint.to_string(), description.to_string(), retry));
        match &self.answer {
            Some(secret) => Ok(secret.clone()),
            None => Err(Error::Cancelled),
        }
    }
}

#[test]
fn passphrase_inquiry_is_relayed_verbatim() -> anyhow::Result<()> {
    // Single-threaded: the socketpair buffers every line, so the acceptor
    // can be driven inline between engine rounds.
    let (theirs, ours) = UnixStream::pair()?;
    let mut acceptor = Transport::from_stream(theirs, Role::Acceptor, ChannelMode::Duplex)?;
    let initiator = Transport::from_stream(ours, Role::Initiator, ChannelMode::Duplex)?;

    let (table, engine) = engine_pair();
    let mut ctx = OperationContext::new(initiator, table);
    let calls = Arc::new(Mutex::new(Vec::new()));
    ctx.set_passphrase_provider(Box::new(RecordingProvider {
        calls:  calls.clone(),
        answer: Some("hunter2".to_string()),
    }));
    ctx.submit("GETPIN")?;

    assert!(matches!(acceptor.recv_request()?, Request::Command { .. }));
    acceptor.send_inquire("PASSPHRASE", "key0 Enter the passphrase")?;
    engine.run_once(DEADLINE)?;

    assert_eq!(acceptor.recv_request()?, Request::Data(b"hunter2".to_vec()));
    assert_eq!(acceptor.recv_request()?, Request::End);
    acceptor.send_status("PINOK", "")?;
    acceptor.send_ok(None)?;

    ctx.wait(&engine, DEADLINE)?;
    assert_eq!(
        calls.lock().unwrap().as_slice(),
        &[("key0".to_string(), "Enter the passphrase".to_string(), false)]
    );
    assert_eq!(ctx.statuses(), vec![("PINOK".to_string(), String::new())]);
    Ok(())
}

#[test]
fn declined_inquiry_cancels_the_operation() -> anyhow::Result<()> {
    let (theirs, ours) = UnixStream::pair()?;
    let mut acceptor = Transport::from_stream(theirs, Role::Acceptor, ChannelMode::Duplex)?;
    let initiator = Transport::from_stream(ours, Role::Initiator, ChannelMode::Duplex)?;

    let (table, engine) = engine_pair();
    let mut ctx = OperationContext::new(initiator, table);
    ctx.set_passphrase_provider(Box::new(RecordingProvider {
        calls:  Arc::new(Mutex::new(Vec::new())),
        answer: None,
    }));
    ctx.submit("GETPIN")?;

    acceptor.recv_request()?;
    acceptor.send_inquire("PASSPHRASE", "key0 Enter the passphrase")?;
    engine.run_once(DEADLINE)?;

    assert_eq!(acceptor.recv_request()?, Request::Can);
    let err = ctx.wait(&engine, DEADLINE).unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    Ok(())
}

#[test]
fn two_operations_share_one_event_loop() -> anyhow::Result<()> {
    let (first, first_peer) = scripted_peer(ChannelMode::Duplex, |t| {
        t.recv_request().unwrap();
        // Delay one peer so readiness genuinely interleaves.
        thread::sleep(Duration::from_millis(50));
        t.send_data(b"first").unwrap();
        t.send_ok(None).unwrap();
    });
    let (second, second_peer) = scripted_peer(ChannelMode::Duplex, |t| {
        t.recv_request().unwrap();
        t.send_data(b"second").unwrap();
        t.send_ok(None).unwrap();
    });

    let (table, engine) = engine_pair();
    let mut first_ctx = OperationContext::new(first, table.clone());
    first_ctx.bind_response_sink(DataObject::empty());
    let mut second_ctx = OperationContext::new(second, table);
    second_ctx.bind_response_sink(DataObject::empty());

    first_ctx.submit("TEST")?;
    second_ctx.submit("TEST")?;

    let first_handle = first_ctx.handle();
    let second_handle = second_ctx.handle();
    engine.run_until(DEADLINE, || {
        first_handle.is_terminal() && second_handle.is_terminal()
    })?;

    first_ctx.wait(&engine, DEADLINE)?;
    second_ctx.wait(&engine, DEADLINE)?;
    assert_eq!(
        first_ctx.take_response_sink().and_then(DataObject::into_bytes),
        Some(b"first".to_vec())
    );
    assert_eq!(
        second_ctx
            .take_response_sink()
            .and_then(DataObject::into_bytes),
        Some(b"second".to_vec())
    );

    first_peer.join().unwrap();
    second_peer.join().unwrap();
    Ok(())
}

struct VecSink(Arc<Mutex<Vec<u8>>>, Arc<AtomicUsize>);

impl DataCallbacks for VecSink {
    fn write(&mut self, buf: &[u8]) -> cryptmux_common::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        self.1.fetch_add(1, Ordering::SeqCst);
        Ok(buf.len())
    }
}

#[test]
fn side_channel_pumps_survive_partial_transfers() -> anyhow::Result<()> {
    // A payload well past the pipe capacity forces short writes and many
    // rounds.
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let pipe = create_pipe()?;

    let (theirs, ours) = UnixStream::pair()?;
    let _acceptor = Transport::from_stream(theirs, Role::Acceptor, ChannelMode::Duplex)?;
    let initiator = Transport::from_stream(ours, Role::Initiator, ChannelMode::Duplex)?;

    let (table, engine) = engine_pair();
    let mut ctx = OperationContext::new(initiator, table.clone());

    let collected = Arc::new(Mutex::new(Vec::new()));
    let writes = Arc::new(AtomicUsize::new(0));
    ctx.attach_source(DataObject::from_bytes(payload.clone()), pipe.write);
    ctx.attach_sink(
        DataObject::from_callbacks(Box::new(VecSink(collected.clone(), writes.clone()))),
        pipe.read,
    );

    engine.run_until(DEADLINE, || table.is_empty())?;

    assert_eq!(collected.lock().unwrap().as_slice(), payload.as_slice());
    assert!(writes.load(Ordering::SeqCst) > 1);
    Ok(())
}
