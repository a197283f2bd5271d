//! Accept loop spawning one task per connection.
//!
//! Tasks only yield at I/O, so a search runs to completion before any other
//! connection makes progress, the same guarantee the mio loop gives. Open
//! connections are tracked in a registry owned by the server, holding each
//! task's abort handle so shutdown can cancel in-flight work.

use crate::handler::RequestHandler;
use crate::protocol::MAX_QUERY_SIZE;
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::{Multiplexer, RuntimeOptions, Shutdown};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

type Registry = Arc<Mutex<ConnectionRegistry<AbortHandle>>>;

/// Pause after a failed accept. Errors such as EMFILE persist until a
/// connection closes, so retrying at once would spin the thread.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Multiplexer running connection tasks on a current-thread runtime.
pub struct TaskServer {
    listener: std::net::TcpListener,
    handler: Arc<RequestHandler>,
    registry: Registry,
}

impl TaskServer {
    pub fn new(
        listener: std::net::TcpListener,
        options: &RuntimeOptions,
        handler: Arc<RequestHandler>,
    ) -> Self {
        Self {
            listener,
            handler,
            registry: Arc::new(Mutex::new(ConnectionRegistry::new(options.max_connections))),
        }
    }

    async fn serve(self, shutdown: Shutdown) -> io::Result<()> {
        let listener = TcpListener::from_std(self.listener)?;
        info!(addr = %listener.local_addr()?, "Starting task loop");

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        spawn_connection(stream, peer, &self.handler, &self.registry);
                    }
                    Err(e) => accept_failed(&e).await,
                },
            }
        }

        for conn in lock(&self.registry).drain() {
            conn.stream.abort();
        }
        info!("Task loop stopped");
        Ok(())
    }
}

impl Multiplexer for TaskServer {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn run(self: Box<Self>, shutdown: Shutdown) -> io::Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.serve(shutdown))
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: &Arc<RequestHandler>,
    registry: &Registry,
) {
    let mut connections = lock(registry);
    if connections.is_full() {
        warn!(peer = %peer, "Connection limit reached, dropping connection");
        return;
    }

    let handler = Arc::clone(handler);
    let task_registry = Arc::clone(registry);

    // The lock is held until the entry exists, so the task cannot try to
    // remove itself first.
    let conn_id = connections.insert_with(move |conn_id| {
        let task = tokio::spawn(async move {
            let mut stream = stream;
            if let Err(e) = handle_connection(&mut stream, peer, &handler).await {
                warn!(conn_id, peer = %peer, error = %e, "Connection error");
            }
            if lock(&task_registry).remove(conn_id).is_some() {
                info!(conn_id, peer = %peer, "Closing client connection");
            }
            drop(stream);
        });
        Connection::new(task.abort_handle(), peer)
    });

    if let Some(conn_id) = conn_id {
        info!(conn_id, peer = %peer, "Got a connection");
    }
}

async fn handle_connection(
    stream: &mut TcpStream,
    peer: SocketAddr,
    handler: &RequestHandler,
) -> io::Result<()> {
    let mut buf = vec![0u8; MAX_QUERY_SIZE];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        info!(peer = %peer, "Client closed connection");
        return Ok(());
    }

    info!(peer = %peer, query = %String::from_utf8_lossy(&buf[..n]), "Got query");
    let response = handler.respond(&buf[..n]);

    // write_all retries partial writes, yielding while the socket is full.
    stream.write_all(&response).await?;
    stream.shutdown().await?;
    debug!(peer = %peer, bytes = response.len(), "Response sent");
    Ok(())
}

async fn accept_failed(err: &io::Error) {
    error!(error = %err, "Accept error");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::fake_handler;
    use crate::runtime::create_listener;
    use std::io::{Read, Write};

    fn start() -> (SocketAddr, Shutdown, std::thread::JoinHandle<io::Result<()>>) {
        let listener = create_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let options = RuntimeOptions {
            poll_timeout: Duration::from_millis(20),
            max_connections: 8,
        };
        let (handler, _) = fake_handler(false);
        let server = Box::new(TaskServer::new(listener, &options, Arc::new(handler)));
        let addr = server.local_addr().unwrap();
        let shutdown = Shutdown::new();
        let handle = {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || server.run(shutdown))
        };
        (addr, shutdown, handle)
    }

    #[test]
    fn test_serves_query_and_stops() {
        let (addr, shutdown, handle) = start();

        let _idle = std::net::TcpStream::connect(addr).unwrap();
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"search ['x']").unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        assert_eq!(response, "machine.log: 1\nx\n");

        shutdown.trigger();
        handle.join().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_accept_failure_backs_off() {
        let err = io::Error::new(io::ErrorKind::Other, "too many open files");
        let begin = std::time::Instant::now();
        accept_failed(&err).await;
        assert!(begin.elapsed() >= ACCEPT_ERROR_BACKOFF);
    }

    #[test]
    fn test_malformed_query() {
        let (addr, shutdown, handle) = start();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"hello").unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        assert_eq!(response, crate::protocol::MALFORMED_QUERY_MESSAGE);

        shutdown.trigger();
        handle.join().unwrap().unwrap();
    }
}
