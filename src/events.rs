//! Lifecycle event sink.
//!
//! The event loop reports connection lifecycle and errors through an
//! [`EventSink`] instead of printing. The default sink forwards everything
//! to `tracing`; where the output goes (console, log file) is decided by the
//! subscriber installed by the binary.

use crate::runtime::PeerAddr;
use std::fmt;
use tracing::{debug, info, warn};

/// Receiver of server lifecycle events.
pub trait EventSink: Send {
    /// A connection completed the handshake.
    fn on_connect(&mut self, id: usize, peer: &PeerAddr);

    /// An open connection was closed.
    fn on_disconnect(&mut self, id: usize, peer: &PeerAddr, reason: &str);

    /// A connection-scoped or loop-level failure.
    fn on_error(&mut self, peer: Option<&PeerAddr>, error: &dyn fmt::Display);

    /// Free-form progress messages.
    fn on_debug(&mut self, message: &str);
}

/// Emits every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEvents;

impl EventSink for TracingEvents {
    fn on_connect(&mut self, id: usize, peer: &PeerAddr) {
        info!(conn_id = id, peer = %peer, "New connection accepted");
    }

    fn on_disconnect(&mut self, id: usize, peer: &PeerAddr, reason: &str) {
        info!(conn_id = id, peer = %peer, reason, "Connection closed");
    }

    fn on_error(&mut self, peer: Option<&PeerAddr>, error: &dyn fmt::Display) {
        match peer {
            Some(peer) => warn!(peer = %peer, error = %error, "Connection error"),
            None => warn!(error = %error, "Server error"),
        }
    }

    fn on_debug(&mut self, message: &str) {
        debug!("{message}");
    }
}
