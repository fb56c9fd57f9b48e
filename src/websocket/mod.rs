//! WebSocket protocol pieces (RFC 6455 subset).
//!
//! - `frame`: binary frame codec
//! - `handshake`: opening handshake negotiation
//!
//! Both are free of I/O; the runtime drives them from its receive buffers.

pub mod frame;
pub mod handshake;

pub use frame::{Decoded, Frame, FrameError, OpCode};
pub use handshake::{HandshakeError, HandshakeInfo, Negotiation};
