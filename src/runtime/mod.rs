//! Connection multiplexers for the log server.
//!
//! Two scheduling strategies sit behind the [`Multiplexer`] trait:
//! - `mio`: readiness event loop (epoll on Linux, kqueue on macOS)
//! - `tokio`: cooperative tasks on a current-thread runtime
//!
//! Both serve one query per connection on a single thread and share:
//! - `RequestHandler`: decode, search, encode
//! - `ConnectionRegistry`: open connections keyed by opaque handles

pub mod connection;
mod mio_impl;
mod tokio_impl;

pub use connection::{ConnState, Connection, ConnectionRegistry};
pub use mio_impl::EventLoop;
pub use tokio_impl::TaskServer;

use crate::config::{RuntimeType, ServerConfig};
use crate::handler::RequestHandler;
use crate::matcher::LogSource;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;

/// Backlog for the listening socket.
const LISTEN_BACKLOG: i32 = 1024;

/// A bound server that can run until told to stop.
pub trait Multiplexer: Send {
    /// Address the listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Serve connections until `shutdown` is triggered.
    fn run(self: Box<Self>, shutdown: Shutdown) -> io::Result<()>;
}

/// Tuning shared by every multiplexer.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Upper bound on a single readiness wait.
    pub poll_timeout: Duration,
    pub max_connections: usize,
}

impl From<&ServerConfig> for RuntimeOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            poll_timeout: config.poll_timeout,
            max_connections: config.max_connections,
        }
    }
}

/// Cancellation token for a running multiplexer.
///
/// The server binary never triggers it; it exists so callers embedding a
/// server can stop it.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    triggered: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Resolve once `trigger` has been called.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Bind `addr` and wrap it in the requested multiplexer.
pub fn bind(
    runtime: RuntimeType,
    addr: SocketAddr,
    options: &RuntimeOptions,
    handler: Arc<RequestHandler>,
) -> io::Result<Box<dyn Multiplexer>> {
    let listener = create_listener(addr)?;
    Ok(match runtime {
        RuntimeType::Mio => Box::new(EventLoop::new(listener, options, handler)?),
        RuntimeType::Tokio => Box::new(TaskServer::new(listener, options, handler)),
    })
}

/// Run a log server with `config` until the process exits.
pub fn run(config: &ServerConfig) -> io::Result<()> {
    let source = LogSource::open(&config.log_source).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("log source '{}': {}", config.log_source.display(), e),
        )
    })?;
    let matcher = config.matcher.build();

    info!(
        source = %source.path().display(),
        multi_file = source.is_multi_file(),
        matcher = matcher.name(),
        directory_header = ?config.directory_header,
        "Log source ready"
    );

    let handler = Arc::new(RequestHandler::new(source, matcher, config.directory_header));
    let addr = resolve(&config.listen)?;
    let server = bind(config.runtime, addr, &RuntimeOptions::from(config), handler)?;

    info!(addr = %server.local_addr()?, runtime = ?config.runtime, "Serving");
    server.run(Shutdown::new())
}

/// Resolve a `host:port` string to the first matching address.
pub fn resolve(listen: &str) -> io::Result<SocketAddr> {
    listen.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address found for '{listen}'"),
        )
    })
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
pub fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_listener_is_nonblocking() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_resolve() {
        assert_eq!(
            resolve("127.0.0.1:8000").unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 8000))
        );
        assert!(resolve("not an address").is_err());
    }

    #[tokio::test]
    async fn test_shutdown_wait() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };
        tokio::task::yield_now().await;
        shutdown.trigger();
        tokio_test::assert_ok!(waiter.await);

        // Already triggered: returns immediately.
        shutdown.wait().await;
        assert!(shutdown.is_triggered());
    }
}
