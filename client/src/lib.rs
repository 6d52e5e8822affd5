//! Cryptmux Engine Client Library
//!
//! This crate is the client side of the cryptmux engine IPC layer. It talks
//! to a separately-running cryptographic engine process over pipes or a
//! local socket, multiplexing any number of concurrent engine conversations
//! through one poll loop:
//!
//! - [`data::DataObject`] — one byte-stream interface over memory, file,
//!   descriptor and custom-callback backends
//! - [`fdtable::FdTable`] — the lock-protected registry of descriptors
//!   awaiting readiness
//! - [`event::EventEngine`] — the poll loop dispatching readiness to
//!   registered callbacks
//! - [`transport::Transport`] — the line-oriented command/response channel
//!   with its greeting handshake
//! - [`context::OperationContext`] — one in-flight command bound to its
//!   transport and data objects
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cryptmux_client::{
//!     ChannelMode, DataObject, EventEngine, FdTable, OperationContext, Transport,
//! };
//! use cryptmux_common::EngineConfig;
//!
//! # fn main() -> cryptmux_common::Result<()> {
//! let config = EngineConfig::from_env()?;
//! let transport = Transport::spawn(&config, ChannelMode::Duplex)?;
//!
//! let table = Arc::new(FdTable::new());
//! let engine = EventEngine::new(table.clone());
//!
//! let mut ctx = OperationContext::new(transport, table);
//! ctx.bind_response_sink(DataObject::empty());
//! ctx.submit("ECHO hello")?;
//! ctx.wait(&engine, None)?;
//!
//! let reply = ctx.take_response_sink().and_then(|d| d.into_bytes());
//! println!("engine replied: {reply:?}");
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod data;
pub mod event;
pub mod fdtable;
pub mod op;
pub mod transport;

pub use context::{OperationContext, PassphraseProvider};
pub use data::{DataCallbacks, DataObject, Encoding};
pub use event::EventEngine;
pub use fdtable::{CallbackStatus, FdTable, IoCallback, IoToken};
pub use op::{OpStatus, OperationHandle};
pub use transport::{ChannelMode, PeerInfo, Role, Transport, TransportState};
// Re-export the shared layer types callers always need alongside this crate.
pub use cryptmux_common::platform_io::Direction;
pub use cryptmux_common::{EngineConfig, Error, Request, Response, Result};
