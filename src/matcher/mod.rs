//! Pattern matching over a server's log source.
//!
//! The request handler only sees the [`Matcher`] trait. Two engines exist:
//! - `scan`: in-process regex scan (default)
//! - `grep`: runs the system `grep -E` once for counts and once for lines
//!
//! Both return the same [`MatchResult`] shape, so the wire format does not
//! depend on which one the server was started with.

mod grep;
mod scan;

pub use grep::GrepMatcher;
pub use scan::ScanMatcher;

use bytes::Bytes;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Where a server reads its logs from. Fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSource {
    /// A single log file.
    File(PathBuf),
    /// Every regular file directly inside a directory.
    Directory(PathBuf),
}

impl LogSource {
    /// Inspect `path` and classify it as a file or a directory.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path)?;
        if meta.is_dir() {
            Ok(LogSource::Directory(path.to_path_buf()))
        } else {
            Ok(LogSource::File(path.to_path_buf()))
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            LogSource::File(p) | LogSource::Directory(p) => p,
        }
    }

    pub fn is_multi_file(&self) -> bool {
        matches!(self, LogSource::Directory(_))
    }

    /// Files to search, in name order for directories.
    pub fn files(&self) -> io::Result<Vec<PathBuf>> {
        match self {
            LogSource::File(p) => Ok(vec![p.clone()]),
            LogSource::Directory(dir) => {
                let mut files = Vec::new();
                for entry in std::fs::read_dir(dir)? {
                    let entry = entry?;
                    if entry.file_type()?.is_file() {
                        files.push(entry.path());
                    }
                }
                files.sort();
                Ok(files)
            }
        }
    }
}

/// Matches found in one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMatches {
    /// Base name of the file.
    pub name: String,
    pub count: usize,
}

/// Outcome of a search.
///
/// `total` always equals the number of newline-terminated entries in
/// `lines`; clients rely on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub files: Vec<FileMatches>,
    pub total: usize,
    /// Matched lines, each terminated by `\n`. Lines from a directory source
    /// are prefixed with `<file name>:`.
    pub lines: Bytes,
    pub multi_file: bool,
}

impl MatchResult {
    /// Result for a source with no files to search.
    pub fn empty(multi_file: bool) -> Self {
        Self {
            files: Vec::new(),
            total: 0,
            lines: Bytes::new(),
            multi_file,
        }
    }
}

/// Search engine contract used by the request handler.
pub trait Matcher: Send + Sync {
    /// Find every line in `source` matching any of `terms`.
    fn search(&self, terms: &[String], source: &LogSource) -> Result<MatchResult, MatcherError>;

    /// Short engine name for logs.
    fn name(&self) -> &'static str;
}

/// Which engine a server uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MatcherKind {
    #[default]
    Scan,
    Grep,
}

impl MatcherKind {
    pub fn build(self) -> Box<dyn Matcher> {
        match self {
            MatcherKind::Scan => Box::new(ScanMatcher::new()),
            MatcherKind::Grep => Box::new(GrepMatcher::new()),
        }
    }
}

/// Matcher failures. Peers only ever see `command failed`.
#[derive(Debug)]
pub enum MatcherError {
    /// A log file could not be read.
    Io(PathBuf, io::Error),
    /// A term is not a valid pattern.
    InvalidPattern(String),
    /// The external search command could not be started.
    Spawn(io::Error),
    /// The external search command reported an error.
    Command(String),
}

impl fmt::Display for MatcherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatcherError::Io(path, e) => write!(f, "failed to read '{}': {}", path.display(), e),
            MatcherError::InvalidPattern(e) => write!(f, "invalid pattern: {e}"),
            MatcherError::Spawn(e) => write!(f, "failed to start search command: {e}"),
            MatcherError::Command(stderr) => write!(f, "search command failed: {stderr}"),
        }
    }
}

impl std::error::Error for MatcherError {}

/// Base name of `path` as sent in response headers.
pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
