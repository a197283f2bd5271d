//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//!
//! One thread owns the listener, the poll instance and every connection.
//! A read-ready connection is served to completion (read, search, encode,
//! write) before the next event is dispatched. Only a response that does
//! not fit the socket buffer outlives the event, parked in `Writing` until
//! the socket is writable again, so a slow reader never holds up others.

use crate::handler::{HandleResult, RequestHandler, WriteProgress};
use crate::runtime::connection::{ConnState, Connection, ConnectionRegistry};
use crate::runtime::{Multiplexer, RuntimeOptions, Shutdown};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 1024;

/// Single-threaded readiness loop serving one query per connection.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: ConnectionRegistry<TcpStream>,
    handler: Arc<RequestHandler>,
    poll_timeout: Duration,
}

impl EventLoop {
    /// Take ownership of a bound non-blocking listener and register it.
    pub fn new(
        listener: std::net::TcpListener,
        options: &RuntimeOptions,
        handler: Arc<RequestHandler>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            connections: ConnectionRegistry::new(options.max_connections),
            handler,
            poll_timeout: options.poll_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Sockets registered with the poll instance: the listener plus every
    /// open connection.
    pub fn registered(&self) -> usize {
        1 + self.connections.len()
    }

    /// Wait for readiness once and dispatch what arrived.
    ///
    /// Returns the number of events handled. Zero means the wait timed out,
    /// which is not an error.
    pub fn run_once(&mut self) -> io::Result<usize> {
        match self.poll.poll(&mut self.events, Some(self.poll_timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        if self.events.is_empty() {
            trace!(
                open = self.connections.len(),
                awaiting = self.connections.awaiting_request(),
                "Poll timed out"
            );
            return Ok(0);
        }

        let ready: Vec<(Token, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_writable()))
            .collect();

        for &(token, writable) in &ready {
            match token {
                LISTENER_TOKEN => self.accept_connections()?,
                Token(conn_id) => self.handle_connection_event(conn_id, writable),
            }
        }

        Ok(ready.len())
    }

    fn accept_connections(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.connections.is_full() {
                        warn!(peer = %peer, "Connection limit reached, dropping connection");
                        continue;
                    }

                    let conn_id = match self.connections.insert(Connection::new(stream, peer)) {
                        Some(id) => id,
                        None => continue,
                    };

                    // Re-borrow after insert
                    let registered = match self.connections.get_mut(conn_id) {
                        Some(conn) => self.poll.registry().register(
                            &mut conn.stream,
                            Token(conn_id),
                            Interest::READABLE,
                        ),
                        None => continue,
                    };

                    if let Err(e) = registered {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                        self.connections.remove(conn_id);
                        continue;
                    }

                    info!(conn_id, peer = %peer, "Got a connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_connection_event(&mut self, conn_id: usize, writable: bool) {
        // A previous event in this batch may have closed it.
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };
        let peer = conn.peer;

        let done = if conn.is_awaiting_request() {
            match self.handler.serve(&mut conn.stream, peer) {
                HandleResult::Pending => false,
                HandleResult::Disconnected => {
                    info!(conn_id, peer = %peer, "Client closed connection");
                    true
                }
                HandleResult::Served { bytes } => {
                    debug!(conn_id, peer = %peer, bytes, "Response sent");
                    true
                }
                HandleResult::Blocked(pending) => {
                    let interest = self.poll.registry().reregister(
                        &mut conn.stream,
                        Token(conn_id),
                        Interest::WRITABLE,
                    );
                    conn.start_writing(pending);
                    match interest {
                        Ok(()) => false,
                        Err(e) => {
                            warn!(conn_id, peer = %peer, error = %e, "Failed to wait for writable");
                            true
                        }
                    }
                }
                HandleResult::Failed(e) => {
                    warn!(conn_id, peer = %peer, error = %e, "Connection error");
                    true
                }
            }
        } else if let ConnState::Writing(pending) = &mut conn.state {
            if !writable {
                return;
            }
            match pending.write_to(&mut conn.stream) {
                Ok(WriteProgress::Done) => {
                    debug!(conn_id, peer = %peer, bytes = pending.len(), "Response sent");
                    true
                }
                Ok(WriteProgress::Blocked) => false,
                Err(e) => {
                    warn!(conn_id, peer = %peer, error = %e, "Failed to send response");
                    true
                }
            }
        } else {
            false
        };

        if done {
            self.close_connection(conn_id);
        }
    }

    fn close_connection(&mut self, conn_id: usize) {
        // The registry entry goes first; the socket closes when `conn` drops.
        if let Some(mut conn) = self.connections.remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            info!(conn_id, peer = %conn.peer, "Closing client connection");
        }
    }
}

impl Multiplexer for EventLoop {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        EventLoop::local_addr(self)
    }

    fn run(mut self: Box<Self>, shutdown: Shutdown) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "Starting mio event loop");
        while !shutdown.is_triggered() {
            self.run_once()?;
        }
        for mut conn in self.connections.drain() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
        info!("Event loop stopped");
        Ok(())
    }
}
