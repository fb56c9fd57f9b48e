//! Single-threaded readiness runtime.
//!
//! - `transport`: byte-stream and listener abstractions (TCP, Unix)
//! - `connection`: per-connection state machine and slab registry
//! - `event_loop`: the mio reactor driving handshakes and frames

mod connection;
mod event_loop;
mod transport;

pub use connection::{ConnState, Connection, ConnectionRegistry, ReadOutcome};
pub use event_loop::{CloseReason, EventLoop, LoopLimits, StopHandle};
pub use transport::{Acceptor, Endpoint, PeerAddr, Transport};
