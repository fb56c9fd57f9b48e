//! ws-reactor: a single-threaded WebSocket server engine.
//!
//! Accepts TCP or Unix-domain connections, performs the RFC 6455 opening
//! handshake, and exchanges frames with every client from one mio event
//! loop. Decoded messages are handed to a caller-supplied
//! [`MessageHandler`].
//!
//! ```no_run
//! use ws_reactor::{OpCode, Server, ServerSettings, Session};
//!
//! let handler = |session: &mut Session<'_>, payload: &[u8]| {
//!     let _ = session.send(payload, OpCode::Text);
//! };
//! let mut server = Server::bind("127.0.0.1:7777", ServerSettings::default(), handler)?;
//! server.start()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod commands;
pub mod config;
pub mod events;
pub mod handler;
pub mod runtime;
pub mod server;
pub mod websocket;

pub use events::{EventSink, TracingEvents};
pub use handler::{MessageHandler, Session};
pub use runtime::{PeerAddr, StopHandle};
pub use server::{Server, ServerError, ServerSettings};
pub use websocket::OpCode;
