//! A stub engine for exercising the cryptmux IPC layer end to end.
//!
//! Speaks the line protocol as an acceptor, either on its own stdio (the
//! shape a spawned engine has) or on a rendezvous socket serving one peer at
//! a time. Commands:
//!
//! - `NOP` — immediate `OK`
//! - `ECHO <text>` — the argument back as one data line, then `OK`
//! - `TEST` — a canned base64 payload (`aGVsbG8=`), then `OK`
//! - `GETPIN` — a `PASSPHRASE` inquiry; answers with `S PINLEN <n>` + `OK`
//! - `BYE` — `OK` and connection teardown
//!
//! Anything else earns `ERR 103 Unknown command`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use cryptmux_client::{ChannelMode, Role, Transport, TransportState};
use cryptmux_common::platform_io::{bind_socket, dup_fd};
use cryptmux_common::protocol::codes;
use cryptmux_common::{Error, Request};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fake-engine")]
#[command(about = "Stub cryptmux engine")]
struct Args {
    /// Serve on a rendezvous socket instead of stdio.
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Tear the channel down after a single command cycle.
    #[arg(long)]
    one_shot: bool,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Diagnostics go to stderr; stdout may be the protocol channel.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).context("invalid log level")?,
        )
        .with_writer(std::io::stderr)
        .init();

    let mode = if args.one_shot {
        ChannelMode::OneShot
    } else {
        ChannelMode::Duplex
    };

    match args.socket {
        Some(path) => {
            let listener = bind_socket(&path)?;
            tracing::info!(path = %path.display(), "stub engine listening");
            loop {
                match Transport::accept(&listener, mode) {
                    Ok(transport) => {
                        if let Some(creds) = transport.peer().credentials {
                            tracing::info!(pid = creds.pid, uid = creds.uid, "peer connected");
                        }
                        if let Err(e) = serve(transport) {
                            tracing::error!("connection ended with error: {e:#}");
                        }
                    }
                    Err(e) => tracing::error!("accept failed: {e}"),
                }
            }
        }
        None => {
            // Stdin carries the peer's lines, stdout ours.
            let inbound = dup_fd(0)?;
            let outbound = dup_fd(1)?;
            let transport = Transport::from_pipes(inbound, outbound, Role::Acceptor, mode)?;
            serve(transport)
        }
    }
}

/// Serve one peer until it says BYE, hangs up, or exhausts a one-shot
/// channel.
fn serve(mut transport: Transport) -> Result<()> {
    loop {
        let request = match transport.recv_request_deadline(None) {
            Ok(request) => request,
            Err(Error::PeerClosed) => {
                tracing::info!("peer disconnected");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match request {
            Request::Command { name, args } => {
                tracing::debug!(command = %name, "serving");
                match name.as_str() {
                    "NOP" => transport.send_ok(None)?,
                    "ECHO" => {
                        transport.send_data(args.as_bytes())?;
                        transport.send_ok(None)?;
                    }
                    "TEST" => {
                        transport.send_data(b"aGVsbG8=")?;
                        transport.send_ok(None)?;
                    }
                    "GETPIN" => handle_getpin(&mut transport)?,
                    "BYE" => {
                        transport.send_ok(Some("closing connection"))?;
                        return Ok(());
                    }
                    _ => transport.send_err(codes::UNKNOWN_COMMAND, "Unknown command")?,
                }
            }
            Request::Comment(_) => continue,
            other => {
                tracing::warn!(?other, "line out of sequence, dropping peer");
                return Ok(());
            }
        }

        if transport.state() == TransportState::Closed {
            tracing::info!("one-shot cycle served, closing");
            return Ok(());
        }
    }
}

/// Run the `PASSPHRASE` inquiry flow and report the secret's length back as
/// a status line (the stub never stores the secret).
fn handle_getpin(transport: &mut Transport) -> Result<()> {
    transport.send_inquire("PASSPHRASE", "key0 Enter the passphrase for key0")?;
    let mut secret = Vec::new();
    loop {
        match transport.recv_request_deadline(None)? {
            Request::Data(chunk) => secret.extend_from_slice(&chunk),
            Request::End => {
                transport.send_status("PINLEN", &secret.len().to_string())?;
                transport.send_ok(None)?;
                return Ok(());
            }
            Request::Can => {
                tracing::info!("peer cancelled the inquiry");
                transport.send_err(codes::CANCELED, "operation cancelled")?;
                return Ok(());
            }
            Request::Comment(_) => continue,
            Request::Command { .. } => {
                anyhow::bail!("command line arrived inside an inquiry")
            }
        }
    }
}
