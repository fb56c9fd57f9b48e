//! WebSocket server composition root.
//!
//! Binds the listener, owns the event loop and the message handler, and
//! exposes start/stop/send.

use crate::config::Config;
use crate::events::{EventSink, TracingEvents};
use crate::handler::{MessageHandler, Session};
use crate::runtime::{Endpoint, EventLoop, LoopLimits, PeerAddr, StopHandle};
use crate::websocket::OpCode;
use std::io;
use std::time::Duration;
use tracing::info;

/// Runtime settings of a server.
#[derive(Debug, Clone, Copy)]
pub struct ServerSettings {
    /// Stop after this long; `None` runs until stopped.
    pub time_limit: Option<Duration>,
    pub max_connections: usize,
    pub read_chunk: usize,
    pub max_frame_size: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            time_limit: None,
            max_connections: 1024,
            read_chunk: 100_000,
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

impl From<&Config> for ServerSettings {
    fn from(config: &Config) -> Self {
        Self {
            time_limit: (config.time_limit > 0).then(|| Duration::from_secs(config.time_limit)),
            max_connections: config.max_connections,
            read_chunk: config.read_chunk,
            max_frame_size: config.max_frame_size,
        }
    }
}

/// Server startup errors.
#[derive(Debug)]
pub enum ServerError {
    InvalidAddress(String, io::Error),
    Bind(Endpoint, io::Error),
    Poll(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::InvalidAddress(addr, e) => write!(f, "Invalid listen address '{addr}': {e}"),
            ServerError::Bind(endpoint, e) => write!(f, "Failed to bind {endpoint}: {e}"),
            ServerError::Poll(e) => write!(f, "Failed to create poll: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::InvalidAddress(_, e) | ServerError::Bind(_, e) | ServerError::Poll(e) => {
                Some(e)
            }
        }
    }
}

/// A bound WebSocket server.
pub struct Server<H> {
    event_loop: EventLoop,
    handler: H,
    local_addr: PeerAddr,
}

impl<H: MessageHandler> Server<H> {
    /// Bind `listen` (`host:port` or `unix:<path>`) and prepare the loop.
    pub fn bind(listen: &str, settings: ServerSettings, handler: H) -> Result<Self, ServerError> {
        let endpoint = Endpoint::parse(listen)
            .map_err(|e| ServerError::InvalidAddress(listen.to_string(), e))?;
        let listener = endpoint
            .bind()
            .map_err(|e| ServerError::Bind(endpoint.clone(), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Bind(endpoint.clone(), e))?;

        let limits = LoopLimits {
            time_limit: settings.time_limit,
            max_connections: settings.max_connections,
            read_chunk: settings.read_chunk,
            max_frame_size: settings.max_frame_size,
        };
        let event_loop =
            EventLoop::new(listener, limits, Box::new(TracingEvents)).map_err(ServerError::Poll)?;

        info!(addr = %local_addr, "Server bound");

        Ok(Self {
            event_loop,
            handler,
            local_addr,
        })
    }

    /// Replace the default tracing event sink.
    pub fn with_events(mut self, sink: impl EventSink + 'static) -> Self {
        self.event_loop.set_sink(Box::new(sink));
        self
    }

    /// Address the server was bound to.
    pub fn local_addr(&self) -> &PeerAddr {
        &self.local_addr
    }

    /// Handle for stopping the server from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.event_loop.stop_handle()
    }

    /// Run the event loop on this thread until stopped or the time budget
    /// expires.
    pub fn start(&mut self) -> io::Result<()> {
        self.event_loop.run(&mut self.handler)
    }

    /// Close the listener and every connection. Idempotent.
    pub fn stop(&mut self) {
        self.event_loop.stop();
    }

    pub fn is_running(&self) -> bool {
        self.event_loop.is_running()
    }

    /// Number of connections past the handshake.
    pub fn open_connections(&self) -> usize {
        self.event_loop.registry().open_count()
    }
}

/// Send one frame on the session's connection from inside a handler.
///
/// Same as [`Session::send`]: fails with `NotConnected` unless the
/// connection is open, and queues what the socket cannot take yet.
pub fn send(session: &mut Session<'_>, payload: &[u8], opcode: OpCode) -> io::Result<()> {
    session.send(payload, opcode)
}

impl<H> Drop for Server<H> {
    fn drop(&mut self) {
        self.event_loop.stop();
    }
}
