//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS. Everything runs on the calling thread; the message handler is
//! invoked inline.
//!
//! ## Iteration
//!
//! 1. Wait for readiness on the listener, every connection and the stop
//!    waker (timing out when the time budget runs out).
//! 2. Accept pending connections; they start in the handshaking state.
//! 3. Read at most one `read_chunk` from every readable connection into its
//!    receive buffer, then either advance its handshake or decode and
//!    dispatch complete frames. A connection that still has data is kept on
//!    the backlog and read again next iteration without blocking in poll.
//! 4. Flush writable connections.
//! 5. Stop if requested or if the time budget has been exceeded.

use crate::events::EventSink;
use crate::handler::{MessageHandler, Session};
use crate::runtime::connection::{ConnState, Connection, ConnectionRegistry, ReadOutcome};
use crate::runtime::transport::{Acceptor, PeerAddr};
use crate::websocket::frame::{self, Decoded, OpCode};
use crate::websocket::handshake::{self, Negotiation, MAX_REQUEST_SIZE};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

const EVENTS_CAPACITY: usize = 1024;

/// Why a connection is being closed. The text goes into the close frame.
#[derive(Debug)]
pub enum CloseReason {
    /// Client sent a close frame or closed its side.
    ClientDemand,
    /// Server shutdown or time budget.
    ServerDemand,
    /// Undecodable frame.
    Protocol(frame::FrameError),
    /// Read or write failure.
    Disconnected(io::Error),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::ClientDemand => write!(f, "Closed on client demand"),
            CloseReason::ServerDemand => write!(f, "Closed on server demand"),
            CloseReason::Protocol(e) => write!(f, "Closed on protocol error: {e}"),
            CloseReason::Disconnected(e) => write!(f, "Connection lost: {e}"),
        }
    }
}

/// Limits applied by the loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopLimits {
    /// Server-wide time budget; `None` runs until stopped.
    pub time_limit: Option<Duration>,
    pub max_connections: usize,
    /// Upper bound of a single socket read.
    pub read_chunk: usize,
    /// Largest accepted frame payload.
    pub max_frame_size: u64,
}

/// Cloneable handle that stops a running loop from another thread.
#[derive(Clone)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    /// Request a graceful stop. The loop exits after its current iteration.
    pub fn stop(&self) -> io::Result<()> {
        self.requested.store(true, Ordering::Release);
        self.waker.wake()
    }
}

/// Reactor owning the poll, the listener and every connection.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: Option<Box<dyn Acceptor>>,
    registry: ConnectionRegistry,
    limits: LoopLimits,
    sink: Box<dyn EventSink>,
    stop_requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
    started: Option<Instant>,
    /// Ready connections collected per iteration: (id, readable, writable).
    ready: Vec<(usize, bool, bool)>,
    /// Connections whose last read hit its budget.
    backlog: Vec<usize>,
}

impl EventLoop {
    /// Register the listener with a fresh poll.
    pub fn new(
        mut listener: Box<dyn Acceptor>,
        limits: LoopLimits,
        sink: Box<dyn EventSink>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener: Some(listener),
            registry: ConnectionRegistry::new(limits.max_connections),
            limits,
            sink,
            stop_requested: Arc::new(AtomicBool::new(false)),
            waker,
            started: None,
            ready: Vec::new(),
            backlog: Vec::new(),
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            requested: Arc::clone(&self.stop_requested),
            waker: Arc::clone(&self.waker),
        }
    }

    pub fn set_sink(&mut self, sink: Box<dyn EventSink>) {
        self.sink = sink;
    }

    /// Address of the listener, while it is open.
    pub fn local_addr(&self) -> Option<PeerAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn is_running(&self) -> bool {
        self.listener.is_some()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Run until stopped, the time budget expires, or polling fails.
    pub fn run<H: MessageHandler + ?Sized>(&mut self, handler: &mut H) -> io::Result<()> {
        if self.listener.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "server has been stopped",
            ));
        }

        let started = *self.started.get_or_insert_with(Instant::now);
        self.sink.on_debug("Server is running");

        loop {
            if self.stop_requested.load(Ordering::Acquire) {
                self.sink.on_debug("Stop requested. Stopping server.");
                self.stop();
                return Ok(());
            }

            // Edge-triggered readiness will not repeat for backlogged data
            let timeout = if self.backlog.is_empty() {
                self.limits
                    .time_limit
                    .map(|limit| limit.saturating_sub(started.elapsed()))
            } else {
                Some(Duration::ZERO)
            };

            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.sink.on_error(None, &e);
                self.stop();
                return Err(e);
            }

            let mut accept = false;
            self.ready.clear();
            for event in self.events.iter() {
                match event.token() {
                    LISTENER_TOKEN => accept = true,
                    WAKER_TOKEN => {}
                    Token(id) => self.ready.push((
                        id,
                        event.is_readable() || event.is_read_closed() || event.is_error(),
                        event.is_writable(),
                    )),
                }
            }
            for id in self.backlog.drain(..) {
                if !self.ready.iter().any(|&(r, readable, _)| r == id && readable) {
                    self.ready.push((id, true, false));
                }
            }

            if accept {
                self.accept_connections();
            }

            let ready = std::mem::take(&mut self.ready);
            for &(id, readable, writable) in &ready {
                if writable {
                    self.handle_writable(id);
                }
                if readable {
                    self.handle_readable(id, handler);
                }
            }
            self.ready = ready;

            if let Some(limit) = self.limits.time_limit {
                if started.elapsed() >= limit {
                    self.sink.on_debug("Time limit. Stopping server.");
                    self.stop();
                    return Ok(());
                }
            }
        }
    }

    /// Close the listener and every connection. Open connections get a
    /// close frame first. Calling it again does nothing.
    pub fn stop(&mut self) {
        let Some(mut listener) = self.listener.take() else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut listener);
        drop(listener);
        self.backlog.clear();

        for id in self.registry.ids() {
            self.close_connection(id, CloseReason::ServerDemand);
        }
        self.sink.on_debug("Server stopped");
    }

    fn accept_connections(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };

            match listener.accept() {
                Ok((transport, peer)) => {
                    let conn = Connection::new(transport, peer.clone());
                    let id = match self.registry.insert(conn) {
                        Ok(id) => id,
                        Err(mut conn) => {
                            self.sink.on_error(Some(&peer), &"connection limit reached");
                            conn.close();
                            continue;
                        }
                    };

                    let registered = match self.registry.get_mut(id) {
                        Some(conn) => self.poll.registry().register(
                            conn.transport_mut(),
                            Token(id),
                            Interest::READABLE,
                        ),
                        None => continue,
                    };
                    if let Err(e) = registered {
                        self.sink.on_error(Some(&peer), &e);
                        self.discard(id);
                        continue;
                    }

                    self.sink
                        .on_debug(&format!("Accepted connection {id} from {peer}"));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.sink.on_error(None, &e);
                    return;
                }
            }
        }
    }

    fn handle_readable<H: MessageHandler + ?Sized>(&mut self, id: usize, handler: &mut H) {
        let read_chunk = self.limits.read_chunk.max(1);
        let outcome = match self.registry.get_mut(id) {
            Some(conn) => {
                // A handshaking peer never gets more than one byte past the
                // request size limit into its buffer.
                let budget = match conn.state() {
                    ConnState::Handshaking => (MAX_REQUEST_SIZE + 1)
                        .saturating_sub(conn.received().len())
                        .clamp(1, read_chunk),
                    _ => read_chunk,
                };
                conn.fill(read_chunk, budget)
            }
            None => return,
        };

        let (eof, more) = match outcome {
            Ok(ReadOutcome::Data(_)) => (false, false),
            Ok(ReadOutcome::Limited(_)) => (false, true),
            Ok(ReadOutcome::Eof(_)) => (true, false),
            Err(e) => {
                self.close_connection(id, CloseReason::Disconnected(e));
                return;
            }
        };

        // Bytes that arrived before EOF are still processed.
        self.process_received(id, handler);

        if eof {
            match self.registry.get(id).map(Connection::state) {
                Some(ConnState::Handshaking) => self.discard(id),
                Some(_) => self.close_connection(id, CloseReason::ClientDemand),
                None => {}
            }
            return;
        }

        self.sync_interest(id);
        if more && self.registry.contains(id) {
            self.backlog.push(id);
        }
    }

    fn process_received<H: MessageHandler + ?Sized>(&mut self, id: usize, handler: &mut H) {
        if let Some(ConnState::Handshaking) = self.registry.get(id).map(Connection::state) {
            self.advance_handshake(id);
        }
        if let Some(ConnState::Open) = self.registry.get(id).map(Connection::state) {
            self.dispatch_frames(id, handler);
        }
    }

    fn advance_handshake(&mut self, id: usize) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };

        match handshake::negotiate(conn.received(), conn.peer()) {
            Ok(Negotiation::Incomplete) => {}
            Ok(Negotiation::Accepted {
                info,
                response,
                consumed,
            }) => {
                conn.consume(consumed);
                if let Err(e) = conn.write_raw(response.as_bytes()) {
                    let peer = conn.peer().clone();
                    self.sink.on_error(Some(&peer), &e);
                    self.discard(id);
                    return;
                }
                conn.open(info);
                let peer = conn.peer().clone();
                self.sink.on_connect(id, &peer);
            }
            Err(e) => {
                let peer = conn.peer().clone();
                self.sink.on_error(Some(&peer), &e);
                self.discard(id);
            }
        }
    }

    fn dispatch_frames<H: MessageHandler + ?Sized>(&mut self, id: usize, handler: &mut H) {
        let max_frame_size = self.limits.max_frame_size;
        loop {
            let Some(conn) = self.registry.get_mut(id) else {
                return;
            };
            if conn.is_broken() {
                let e = io::Error::new(io::ErrorKind::BrokenPipe, "write failed");
                self.close_connection(id, CloseReason::Disconnected(e));
                return;
            }

            match frame::decode_limited(conn.received(), max_frame_size) {
                Ok(Decoded::Incomplete) => return,
                Ok(Decoded::Complete(frame, consumed)) => {
                    conn.consume(consumed);
                    if frame.opcode == OpCode::Close {
                        self.close_connection(id, CloseReason::ClientDemand);
                        return;
                    }
                    let mut session = Session::new(id, frame.opcode, conn);
                    handler.on_message(&mut session, &frame.payload);
                }
                Err(e) => {
                    let peer = conn.peer().clone();
                    self.sink.on_error(Some(&peer), &e);
                    self.close_connection(id, CloseReason::Protocol(e));
                    return;
                }
            }
        }
    }

    fn handle_writable(&mut self, id: usize) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if let Err(e) = conn.flush() {
            self.close_connection(id, CloseReason::Disconnected(e));
            return;
        }
        self.sync_interest(id);
    }

    /// Register for writable readiness exactly while output is queued.
    fn sync_interest(&mut self, id: usize) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if conn.is_broken() {
            let e = io::Error::new(io::ErrorKind::BrokenPipe, "write failed");
            self.close_connection(id, CloseReason::Disconnected(e));
            return;
        }

        let wanted = conn.has_pending_output();
        if wanted == conn.write_interest() {
            return;
        }
        let interest = if wanted {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        match self
            .poll
            .registry()
            .reregister(conn.transport_mut(), Token(id), interest)
        {
            Ok(()) => conn.set_write_interest(wanted),
            Err(e) => self.close_connection(id, CloseReason::Disconnected(e)),
        }
    }

    /// Remove a connection, sending a close frame if it was open.
    fn close_connection(&mut self, id: usize, reason: CloseReason) {
        let Some(mut conn) = self.registry.remove(id) else {
            return;
        };
        let _ = self.poll.registry().deregister(conn.transport_mut());

        let was_open = conn.state() == ConnState::Open;
        let text = reason.to_string();
        if !matches!(reason, CloseReason::Disconnected(_)) {
            conn.begin_close(&text);
        }
        conn.close();

        if was_open {
            self.sink.on_disconnect(id, conn.peer(), &text);
        } else {
            self.sink
                .on_debug(&format!("Dropped connection {id} from {}: {text}", conn.peer()));
        }
    }

    /// Drop a connection that never completed the handshake.
    fn discard(&mut self, id: usize) {
        if let Some(mut conn) = self.registry.remove(id) {
            let _ = self.poll.registry().deregister(conn.transport_mut());
            conn.close();
            self.sink
                .on_debug(&format!("Discarded connection {id} from {}", conn.peer()));
        }
    }
}
