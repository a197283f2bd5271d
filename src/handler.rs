//! Per-connection request handling.
//!
//! A connection carries exactly one query: read once, search, write the
//! whole response, close. The handler is shared by every multiplexer
//! strategy; only the I/O around [`RequestHandler::respond`] differs.

use crate::matcher::{LogSource, Matcher};
use crate::protocol::{self, DirectoryHeader, MAX_QUERY_SIZE};
use bytes::Bytes;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Result of serving a read-ready connection.
#[derive(Debug)]
pub enum HandleResult {
    /// Nothing to read yet; keep waiting for the request.
    Pending,
    /// Peer closed before sending anything. No response was written.
    Disconnected,
    /// Response fully written.
    Served { bytes: usize },
    /// The socket stopped accepting data; resume when it is writable.
    Blocked(PendingResponse),
    /// The connection failed while reading or writing.
    Failed(io::Error),
}

/// Progress of a response write.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteProgress {
    Done,
    Blocked,
}

/// A response that has been built but not fully sent.
#[derive(Debug)]
pub struct PendingResponse {
    data: Bytes,
    written: usize,
}

impl PendingResponse {
    pub fn new(data: Bytes) -> Self {
        Self { data, written: 0 }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Write as much as the stream takes. Partial writes are retried until
    /// everything is sent or the stream would block.
    pub fn write_to<W: Write>(&mut self, stream: &mut W) -> io::Result<WriteProgress> {
        while self.written < self.data.len() {
            match stream.write(&self.data[self.written..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(n) => self.written += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteProgress::Blocked)
                }
                Err(e) => return Err(e),
            }
        }
        stream.flush()?;
        Ok(WriteProgress::Done)
    }
}

/// Turns a query into a response against the server's fixed log source.
pub struct RequestHandler {
    source: LogSource,
    matcher: Box<dyn Matcher>,
    directory_header: DirectoryHeader,
}

impl RequestHandler {
    pub fn new(source: LogSource, matcher: Box<dyn Matcher>, directory_header: DirectoryHeader) -> Self {
        Self {
            source,
            matcher,
            directory_header,
        }
    }

    /// Build the full response for one request.
    ///
    /// Malformed requests never reach the matcher.
    pub fn respond(&self, request: &[u8]) -> Bytes {
        let query = match protocol::decode(request) {
            Ok(query) => query,
            Err(e) => {
                info!(reason = %e, "Rejected malformed query");
                return protocol::encode_error(&e);
            }
        };

        match self.matcher.search(query.terms(), &self.source) {
            Ok(result) => {
                debug!(
                    matcher = self.matcher.name(),
                    matches = result.total,
                    files = result.files.len(),
                    "Search complete"
                );
                protocol::encode_success(&result, self.directory_header)
            }
            Err(e) => {
                warn!(matcher = self.matcher.name(), error = %e, "Search failed");
                protocol::encode_command_failed()
            }
        }
    }

    /// Read a request from a non-blocking stream and answer it.
    ///
    /// The request is read once, up to [`MAX_QUERY_SIZE`] bytes. The caller
    /// closes the connection on every result except `Pending` and `Blocked`.
    pub fn serve<S: Read + Write>(&self, stream: &mut S, peer: SocketAddr) -> HandleResult {
        let mut buf = [0u8; MAX_QUERY_SIZE];
        let n = loop {
            match stream.read(&mut buf) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return HandleResult::Pending,
                Err(e) => return HandleResult::Failed(e),
            }
        };

        if n == 0 {
            return HandleResult::Disconnected;
        }

        info!(peer = %peer, query = %String::from_utf8_lossy(&buf[..n]), "Got query");
        let mut response = PendingResponse::new(self.respond(&buf[..n]));

        match response.write_to(stream) {
            Ok(WriteProgress::Done) => HandleResult::Served {
                bytes: response.len(),
            },
            Ok(WriteProgress::Blocked) => {
                debug!(
                    peer = %peer,
                    written = response.written(),
                    total = response.len(),
                    "Partial write, waiting for writable"
                );
                HandleResult::Blocked(response)
            }
            Err(e) => HandleResult::Failed(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::matcher::{FileMatches, MatchResult, MatcherError};
    use crate::protocol::{COMMAND_FAILED_MESSAGE, MALFORMED_QUERY_MESSAGE};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Matcher that returns one line per term and counts calls.
    pub(crate) struct FakeMatcher {
        pub calls: Arc<AtomicUsize>,
        pub fail: bool,
    }

    impl Matcher for FakeMatcher {
        fn search(&self, terms: &[String], _source: &LogSource) -> Result<MatchResult, MatcherError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(MatcherError::Command("boom".into()));
            }
            let lines: String = terms.iter().map(|t| format!("{t}\n")).collect();
            Ok(MatchResult {
                files: vec![FileMatches {
                    name: "machine.log".into(),
                    count: terms.len(),
                }],
                total: terms.len(),
                lines: Bytes::from(lines),
                multi_file: false,
            })
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    pub(crate) fn fake_handler(fail: bool) -> (RequestHandler, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let matcher = FakeMatcher {
            calls: Arc::clone(&calls),
            fail,
        };
        let handler = RequestHandler::new(
            LogSource::File(PathBuf::from("logs/machine.log")),
            Box::new(matcher),
            DirectoryHeader::Names,
        );
        (handler, calls)
    }

    /// In-memory stream that takes at most `chunk` bytes per write and
    /// reports `WouldBlock` on every other write.
    struct ChoppyStream {
        input: io::Cursor<Vec<u8>>,
        output: Vec<u8>,
        chunk: usize,
        block_next: bool,
        read_error: Option<io::ErrorKind>,
    }

    impl ChoppyStream {
        fn new(input: &[u8], chunk: usize) -> Self {
            Self {
                input: io::Cursor::new(input.to_vec()),
                output: Vec::new(),
                chunk,
                block_next: false,
                read_error: None,
            }
        }
    }

    impl Read for ChoppyStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some(kind) = self.read_error {
                return Err(kind.into());
            }
            self.input.read(buf)
        }
    }

    impl Write for ChoppyStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.block_next = !self.block_next;
            if !self.block_next {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.chunk);
            self.output.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_respond_success() {
        let (handler, calls) = fake_handler(false);
        let response = handler.respond(b"search ['a', 'b']");
        assert_eq!(&response[..], b"machine.log: 2\na\nb\n");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_malformed_query_skips_matcher() {
        let (handler, calls) = fake_handler(false);
        for request in [&b"grep ['a']"[..], b"search ['a'", b"search []"] {
            let response = handler.respond(request);
            assert_eq!(&response[..], MALFORMED_QUERY_MESSAGE.as_bytes());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_matcher_failure_sends_placeholder() {
        let (handler, _) = fake_handler(true);
        assert_eq!(
            &handler.respond(b"search ['a']")[..],
            COMMAND_FAILED_MESSAGE.as_bytes()
        );
    }

    #[test]
    fn test_serve_resumes_partial_writes() {
        let (handler, _) = fake_handler(false);
        let mut stream = ChoppyStream::new(b"search ['alpha', 'beta']", 3);

        let mut pending = match handler.serve(&mut stream, peer()) {
            HandleResult::Blocked(pending) => pending,
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(pending.written(), 3);

        while pending.write_to(&mut stream).unwrap() == WriteProgress::Blocked {}
        assert_eq!(pending.written(), pending.len());
        assert_eq!(stream.output, b"machine.log: 2\nalpha\nbeta\n");
    }

    #[test]
    fn test_serve_writes_whole_response() {
        let (handler, _) = fake_handler(false);
        let mut stream = ChoppyStream::new(b"search ['a']", 1024);

        match handler.serve(&mut stream, peer()) {
            HandleResult::Served { bytes } => assert_eq!(bytes, stream.output.len()),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(stream.output, b"machine.log: 1\na\n");
    }

    #[test]
    fn test_serve_zero_read_sends_nothing() {
        let (handler, calls) = fake_handler(false);
        let mut stream = ChoppyStream::new(b"", 16);

        assert!(matches!(
            handler.serve(&mut stream, peer()),
            HandleResult::Disconnected
        ));
        assert!(stream.output.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_serve_would_block_read_is_pending() {
        let (handler, _) = fake_handler(false);
        let mut stream = ChoppyStream::new(b"search ['a']", 16);
        stream.read_error = Some(io::ErrorKind::WouldBlock);

        assert!(matches!(handler.serve(&mut stream, peer()), HandleResult::Pending));
    }

    #[test]
    fn test_serve_read_error_fails() {
        let (handler, _) = fake_handler(false);
        let mut stream = ChoppyStream::new(b"search ['a']", 16);
        stream.read_error = Some(io::ErrorKind::ConnectionReset);

        assert!(matches!(handler.serve(&mut stream, peer()), HandleResult::Failed(_)));
    }

    #[test]
    fn test_write_gives_up_on_hard_error() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut pending = PendingResponse::new(Bytes::from_static(b"data"));
        let err = pending.write_to(&mut Broken).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
