//! Client side: send one query to every configured server at once and
//! aggregate what comes back.
//!
//! Each server gets its own task, so a refused connection or a hung peer
//! only affects that server's entry. Results are collected per index, in
//! the order the servers were configured, whatever order they finish in.

use crate::protocol::{self, ResponseHeader};
use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::Deserialize;
use std::fmt::{self, Write as _};
use std::io;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A log server to query.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerDescriptor {
    pub host: String,
    pub port: u16,
}

impl ServerDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerDescriptor {
    type Err = String;

    /// Accepts `host:port` and the `host, port` form of `servers.conf`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(',')
            .or_else(|| s.rsplit_once(':'))
            .ok_or_else(|| format!("expected host:port, got '{s}'"))?;
        let host = host.trim();
        if host.is_empty() {
            return Err(format!("missing host in '{s}'"));
        }
        let port = port
            .trim()
            .parse()
            .map_err(|_| format!("invalid port in '{s}'"))?;
        Ok(Self::new(host, port))
    }
}

/// A successful exchange with one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReply {
    /// Parsed first line.
    pub header: ResponseHeader,
    /// Everything received, header included.
    pub logs: String,
    /// Number of lines received, header included.
    pub lines_received: usize,
}

impl ServerReply {
    /// Match count: the header's count when it carries one, otherwise every
    /// line after the header.
    pub fn count(&self) -> usize {
        self.header
            .count
            .unwrap_or_else(|| self.legacy_count())
    }

    /// Count derived from line arithmetic alone.
    pub fn legacy_count(&self) -> usize {
        protocol::legacy_count(self.lines_received)
    }
}

/// Why a server contributed nothing to the report.
#[derive(Debug)]
pub enum FetchError {
    Connect(io::Error),
    Io(io::Error),
    Timeout(Duration),
    /// Response was not UTF-8.
    Decode,
    /// Server answered with a diagnostic instead of results.
    Rejected(String),
    /// The fetch task panicked or was cancelled.
    Task(String),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Connect(e) => write!(f, "connection failed: {e}"),
            FetchError::Io(e) => write!(f, "I/O error: {e}"),
            FetchError::Timeout(t) => write!(f, "timed out after {:.3}s", t.as_secs_f64()),
            FetchError::Decode => write!(f, "response is not valid UTF-8"),
            FetchError::Rejected(msg) => write!(f, "server rejected query: {msg}"),
            FetchError::Task(e) => write!(f, "fetch task failed: {e}"),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<io::Error> for FetchError {
    fn from(e: io::Error) -> Self {
        FetchError::Io(e)
    }
}

/// Result for one server, successful or not.
#[derive(Debug)]
pub struct ServerOutcome {
    pub server: ServerDescriptor,
    pub result: Result<ServerReply, FetchError>,
}

impl ServerOutcome {
    /// Matched lines; zero for a failed server.
    pub fn count(&self) -> usize {
        self.result.as_ref().map(ServerReply::count).unwrap_or(0)
    }

    /// Raw response; empty for a failed server.
    pub fn logs(&self) -> &str {
        self.result.as_ref().map(|r| r.logs.as_str()).unwrap_or("")
    }
}

/// Aggregated results of one broadcast.
#[derive(Debug)]
pub struct Report {
    /// Local time the batch was dispatched.
    pub started_at: DateTime<Local>,
    /// Wall clock from first dispatch to last completion.
    pub elapsed: Duration,
    /// One entry per server, in configuration order.
    pub outcomes: Vec<ServerOutcome>,
}

impl Report {
    pub fn total(&self) -> usize {
        self.outcomes.iter().map(ServerOutcome::count).sum()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_err()).count()
    }

    /// Human-readable report, optionally including every server's logs.
    pub fn render(&self, print_logs: bool) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "query dispatched at {}",
            self.started_at.format("%Y-%m-%d %H:%M:%S%.3f")
        );

        if print_logs {
            for outcome in &self.outcomes {
                let _ = writeln!(out, "logs from server ({}):", outcome.server);
                match &outcome.result {
                    Ok(reply) => {
                        out.push_str(&reply.logs);
                        if !reply.logs.ends_with('\n') {
                            out.push('\n');
                        }
                    }
                    Err(e) => {
                        let _ = writeln!(out, "failed to fetch logs: {e}");
                    }
                }
            }
        }

        out.push_str("matched line count per server:\n");
        for outcome in &self.outcomes {
            match &outcome.result {
                Ok(_) => {
                    let _ = writeln!(out, "{}: {}", outcome.server, outcome.count());
                }
                Err(e) => {
                    let _ = writeln!(out, "{}: 0 (failed: {e})", outcome.server);
                }
            }
        }

        let _ = writeln!(out, "total matched line count for all servers: {}", self.total());
        let _ = writeln!(
            out,
            "total time taken to fetch all the logs from servers: {:.6} seconds",
            self.elapsed.as_secs_f64()
        );
        out
    }
}

/// Sends a query to many servers concurrently.
#[derive(Debug, Clone, Default)]
pub struct FanOut {
    timeout: Option<Duration>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound each server's connect-and-exchange time. `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send `request` to every server and wait for all of them.
    ///
    /// Every exchange is started before any is awaited. A failure only
    /// affects its own entry.
    pub async fn broadcast(&self, servers: &[ServerDescriptor], request: impl Into<Bytes>) -> Report {
        let request = request.into();
        let started_at = Local::now();
        let begin = Instant::now();

        let handles: Vec<JoinHandle<Result<ServerReply, FetchError>>> = servers
            .iter()
            .map(|server| tokio::spawn(fetch(server.clone(), request.clone(), self.timeout)))
            .collect();

        let mut outcomes = Vec::with_capacity(servers.len());
        for (server, handle) in servers.iter().zip(handles) {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(FetchError::Task(e.to_string())),
            };
            match &result {
                Ok(reply) => debug!(server = %server, count = reply.count(), "Fetched logs"),
                Err(e) => warn!(server = %server, error = %e, "Failed to fetch logs"),
            }
            outcomes.push(ServerOutcome {
                server: server.clone(),
                result,
            });
        }

        Report {
            started_at,
            elapsed: begin.elapsed(),
            outcomes,
        }
    }
}

/// Run one exchange with `server`, bounded by `timeout` when given.
pub async fn fetch(
    server: ServerDescriptor,
    request: Bytes,
    timeout: Option<Duration>,
) -> Result<ServerReply, FetchError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, exchange(&server, &request))
            .await
            .map_err(|_| FetchError::Timeout(limit))?,
        None => exchange(&server, &request).await,
    }
}

async fn exchange(server: &ServerDescriptor, request: &[u8]) -> Result<ServerReply, FetchError> {
    let mut stream = TcpStream::connect((server.host.as_str(), server.port))
        .await
        .map_err(FetchError::Connect)?;

    stream.write_all(request).await?;
    stream.flush().await?;

    // Read line by line until the server closes the connection.
    let mut reader = BufReader::new(stream);
    let mut raw = Vec::new();
    let mut lines_received = 0;
    loop {
        let n = reader.read_until(b'\n', &mut raw).await?;
        if n == 0 {
            break;
        }
        lines_received += 1;
    }

    let logs = String::from_utf8(raw).map_err(|_| FetchError::Decode)?;
    let first = logs.lines().next().unwrap_or("");
    let header = protocol::parse_header(first)
        .ok_or_else(|| FetchError::Rejected(first.to_string()))?;

    Ok(ServerReply {
        header,
        logs,
        lines_received,
    })
}
