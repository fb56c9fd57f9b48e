//! Connection state machine and registry.
//!
//! Each connection owns its transport plus a receive buffer (bytes read but
//! not yet consumed by the handshake or frame decoder) and a send buffer
//! (encoded frames not yet accepted by the socket).

use crate::runtime::transport::{PeerAddr, Transport};
use crate::websocket::frame::{self, OpCode};
use crate::websocket::HandshakeInfo;
use bytes::{Buf, BytesMut};
use slab::Slab;
use std::io;

/// Close payloads start with a two-byte status slot, left as spaces.
const CLOSE_STATUS_PLACEHOLDER: &str = "  ";

/// Control frame payloads are limited to 125 bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, waiting for the opening request.
    Handshaking,
    /// Handshake done, exchanging frames.
    Open,
    /// Close frame queued, about to shut down.
    Closing,
    /// Transport shut down.
    Closed,
}

/// Outcome of reading from a readable socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Read this many bytes, socket would now block.
    Data(usize),
    /// Read the whole budget; the socket may hold more.
    Limited(usize),
    /// Peer closed its side after this many bytes.
    Eof(usize),
}

/// A single client connection.
pub struct Connection {
    transport: Box<dyn Transport>,
    peer: PeerAddr,
    state: ConnState,
    recv: BytesMut,
    send: BytesMut,
    request: Option<HandshakeInfo>,
    /// Set once a write failed; the loop drops the connection.
    broken: bool,
    /// Whether the transport is registered for writable readiness.
    write_interest: bool,
}

impl Connection {
    /// Create a new connection in the handshaking state.
    pub fn new(transport: Box<dyn Transport>, peer: PeerAddr) -> Self {
        Self {
            transport,
            peer,
            state: ConnState::Handshaking,
            recv: BytesMut::new(),
            send: BytesMut::new(),
            request: None,
            broken: false,
            write_interest: false,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    /// Handshake details, once open.
    pub fn request(&self) -> Option<&HandshakeInfo> {
        self.request.as_ref()
    }

    pub(crate) fn transport_mut(&mut self) -> &mut Box<dyn Transport> {
        &mut self.transport
    }

    /// Bytes received but not yet consumed.
    pub fn received(&self) -> &[u8] {
        &self.recv
    }

    /// Drop `len` bytes from the front of the receive buffer.
    pub fn consume(&mut self, len: usize) {
        self.recv.advance(len);
    }

    /// Read until the socket would block or `budget` bytes have been taken,
    /// in chunks of at most `chunk` bytes.
    pub fn fill(&mut self, chunk: usize, budget: usize) -> io::Result<ReadOutcome> {
        let mut total = 0;
        while total < budget {
            let start = self.recv.len();
            self.recv.resize(start + chunk.min(budget - total), 0);

            match self.transport.read(&mut self.recv[start..]) {
                Ok(0) => {
                    self.recv.truncate(start);
                    return Ok(ReadOutcome::Eof(total));
                }
                Ok(n) => {
                    self.recv.truncate(start + n);
                    total += n;
                }
                Err(e) => {
                    self.recv.truncate(start);
                    match e.kind() {
                        io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Data(total)),
                        io::ErrorKind::Interrupted => continue,
                        _ => return Err(e),
                    }
                }
            }
        }
        Ok(ReadOutcome::Limited(total))
    }

    /// Transition to open after a successful handshake.
    pub fn open(&mut self, request: HandshakeInfo) {
        self.request = Some(request);
        self.state = ConnState::Open;
    }

    /// Queue raw bytes and try to write them.
    pub fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.send.extend_from_slice(bytes);
        self.flush()
    }

    /// Encode and send one unmasked frame.
    ///
    /// Output the socket cannot take yet stays queued and is flushed when
    /// the socket becomes writable.
    pub fn send(&mut self, payload: &[u8], opcode: OpCode) -> io::Result<()> {
        if self.state != ConnState::Open {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is not open",
            ));
        }
        if opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{opcode} payload exceeds {MAX_CONTROL_PAYLOAD} bytes"),
            ));
        }
        let encoded = frame::encode(payload, opcode)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.write_raw(&encoded)
    }

    /// Queue a close frame carrying `reason` and move to closing.
    ///
    /// Only open connections get a close frame. Write errors are ignored
    /// since the transport is shut down right after.
    pub fn begin_close(&mut self, reason: &str) {
        if self.state == ConnState::Open {
            let payload = close_payload(reason);
            if let Ok(encoded) = frame::encode(&payload, OpCode::Close) {
                let _ = self.write_raw(&encoded);
            }
        }
        self.state = ConnState::Closing;
    }

    /// Shut down the transport.
    pub fn close(&mut self) {
        let _ = self.transport.shutdown();
        self.state = ConnState::Closed;
    }

    /// Write queued output until drained or the socket would block.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.send.is_empty() {
            match self.transport.write(&self.send) {
                Ok(0) => {
                    self.broken = true;
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.send.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.broken = true;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Output is queued behind a full socket.
    pub fn has_pending_output(&self) -> bool {
        !self.send.is_empty()
    }

    /// A write has failed; the connection should be dropped.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub(crate) fn write_interest(&self) -> bool {
        self.write_interest
    }

    pub(crate) fn set_write_interest(&mut self, enabled: bool) {
        self.write_interest = enabled;
    }
}

/// Build a close payload, truncated on a char boundary to fit a control frame.
fn close_payload(reason: &str) -> Vec<u8> {
    let mut text = String::with_capacity(MAX_CONTROL_PAYLOAD);
    text.push_str(CLOSE_STATUS_PLACEHOLDER);
    for c in reason.chars() {
        if text.len() + c.len_utf8() > MAX_CONTROL_PAYLOAD {
            break;
        }
        text.push(c);
    }
    text.into_bytes()
}

/// Registry of live connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. Slab keys double as
/// mio tokens.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns the connection back if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Result<usize, Connection> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    pub fn get(&self, id: usize) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of connections in the open state.
    pub fn open_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|(_, conn)| conn.state == ConnState::Open)
            .count()
    }

    /// Identifiers of all registered connections.
    pub fn ids(&self) -> Vec<usize> {
        self.connections.iter().map(|(id, _)| id).collect()
    }
}
