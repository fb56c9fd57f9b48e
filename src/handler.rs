//! Application message handler contract.

use crate::runtime::{Connection, PeerAddr};
use crate::websocket::{HandshakeInfo, OpCode};
use std::io;

/// Handles decoded application messages.
///
/// Invoked synchronously on the event loop thread once per decoded
/// non-close frame, so it must return promptly. Any `FnMut(&mut Session,
/// &[u8])` closure is a handler.
pub trait MessageHandler: Send {
    fn on_message(&mut self, session: &mut Session<'_>, payload: &[u8]);
}

impl<F> MessageHandler for F
where
    F: FnMut(&mut Session<'_>, &[u8]) + Send,
{
    fn on_message(&mut self, session: &mut Session<'_>, payload: &[u8]) {
        self(session, payload)
    }
}

/// Handle to the connection a message arrived on.
pub struct Session<'a> {
    id: usize,
    opcode: OpCode,
    conn: &'a mut Connection,
}

impl<'a> Session<'a> {
    pub(crate) fn new(id: usize, opcode: OpCode, conn: &'a mut Connection) -> Self {
        Self { id, opcode, conn }
    }

    /// Registry identifier of the connection.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn peer(&self) -> &PeerAddr {
        self.conn.peer()
    }

    /// Opcode of the frame being handled.
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// The opening request of this connection.
    pub fn request(&self) -> Option<&HandshakeInfo> {
        self.conn.request()
    }

    /// Send one frame to this connection.
    pub fn send(&mut self, payload: &[u8], opcode: OpCode) -> io::Result<()> {
        self.conn.send(payload, opcode)
    }

    /// Send a text frame.
    pub fn send_text(&mut self, text: &str) -> io::Result<()> {
        self.send(text.as_bytes(), OpCode::Text)
    }
}
