//! End-to-end tests that spawn the stub engine binary and drive it through
//! the client layer, pipe mode and socket mode both.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cryptmux_client::{
    ChannelMode, DataObject, Error, EventEngine, FdTable, OperationContext, Response, Transport,
    TransportState,
};
use cryptmux_common::config::EngineConfig;

const DEADLINE: Option<Duration> = Some(Duration::from_secs(10));

fn stub_config(args: &[&str]) -> EngineConfig {
    EngineConfig {
        program:     PathBuf::from(env!("CARGO_BIN_EXE_fake-engine")),
        args:        args.iter().map(|s| s.to_string()).collect(),
        socket_path: std::env::temp_dir().join("cryptmux-spawn-unused.sock"),
    }
}

#[test]
fn spawned_engine_serves_a_full_cycle() -> anyhow::Result<()> {
    let transport = Transport::spawn(&stub_config(&[]), ChannelMode::Duplex)?;

    let table = Arc::new(FdTable::new());
    let engine = EventEngine::new(table.clone());
    let mut ctx = OperationContext::new(transport, table);
    ctx.bind_response_sink(DataObject::empty());
    ctx.submit("TEST")?;
    ctx.wait(&engine, DEADLINE)?;

    let chunk = ctx
        .take_response_sink()
        .and_then(DataObject::into_bytes)
        .expect("sink reclaimable after completion");
    assert_eq!(BASE64.decode(&chunk)?, b"hello");
    assert_eq!(ctx.transport().lock().unwrap().state(), TransportState::Ready);

    // Dropping the context closes the transport, which says BYE and reaps
    // the child.
    Ok(())
}

#[test]
fn spawned_one_shot_channel_is_exhausted() -> anyhow::Result<()> {
    let transport = Transport::spawn(&stub_config(&["--one-shot"]), ChannelMode::OneShot)?;

    let table = Arc::new(FdTable::new());
    let engine = EventEngine::new(table.clone());
    let mut ctx = OperationContext::new(transport, table);
    ctx.bind_response_sink(DataObject::empty());
    ctx.submit("ECHO ping")?;
    ctx.wait(&engine, DEADLINE)?;

    assert_eq!(
        ctx.take_response_sink().and_then(DataObject::into_bytes),
        Some(b"ping".to_vec())
    );

    let transport = ctx.transport();
    let err = transport.lock().unwrap().send_command("NOP").unwrap_err();
    assert!(matches!(err, Error::ChannelExhausted));
    Ok(())
}

#[test]
fn socket_mode_accepts_a_connection() -> anyhow::Result<()> {
    let socket_path = std::env::temp_dir().join(format!(
        "cryptmux-spawn-{}.sock",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&socket_path);

    let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_fake-engine"))
        .arg("--socket")
        .arg(&socket_path)
        .spawn()?;

    // Wait for the listener to come up.
    let mut bound = false;
    for _ in 0..200 {
        if socket_path.exists() {
            bound = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(bound, "stub engine never bound its socket");

    let mut transport = Transport::connect(&socket_path, ChannelMode::Duplex)?;
    transport.send_command("ECHO over the socket")?;
    assert_eq!(
        transport.recv_line()?,
        Response::Data(b"over the socket".to_vec())
    );
    assert_eq!(transport.recv_line()?, Response::Ok(None));
    assert_eq!(transport.state(), TransportState::Ready);
    drop(transport);

    child.kill().ok();
    child.wait().ok();
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}
