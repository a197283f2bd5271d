//! In-process matcher: streams each file line by line and tests every line
//! against one alternation of all terms. Only matched lines are kept.

use super::{file_name, FileMatches, LogSource, MatchResult, Matcher, MatcherError};
use bytes::{BufMut, BytesMut};
use regex::bytes::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader};

/// Regex scan over the log files, one pass per file.
#[derive(Debug, Default)]
pub struct ScanMatcher;

impl ScanMatcher {
    pub fn new() -> Self {
        Self
    }

    fn compile(terms: &[String]) -> Result<Regex, MatcherError> {
        let pattern = terms
            .iter()
            .map(|t| format!("(?:{t})"))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&pattern).map_err(|e| MatcherError::InvalidPattern(e.to_string()))
    }
}

impl Matcher for ScanMatcher {
    fn search(&self, terms: &[String], source: &LogSource) -> Result<MatchResult, MatcherError> {
        let re = Self::compile(terms)?;
        let multi_file = source.is_multi_file();
        let paths = source
            .files()
            .map_err(|e| MatcherError::Io(source.path().to_path_buf(), e))?;

        let mut result = MatchResult::empty(multi_file);
        let mut out = BytesMut::new();

        let mut line = Vec::new();
        for path in paths {
            let file = File::open(&path).map_err(|e| MatcherError::Io(path.clone(), e))?;
            let mut reader = BufReader::new(file);
            let name = file_name(&path);
            let mut count = 0;

            loop {
                line.clear();
                let n = reader
                    .read_until(b'\n', &mut line)
                    .map_err(|e| MatcherError::Io(path.clone(), e))?;
                if n == 0 {
                    break;
                }
                // The last line may have no newline.
                let body = line.strip_suffix(b"\n").unwrap_or(&line[..]);
                if !re.is_match(body) {
                    continue;
                }
                if multi_file {
                    out.put_slice(name.as_bytes());
                    out.put_u8(b':');
                }
                out.put_slice(body);
                out.put_u8(b'\n');
                count += 1;
            }

            result.total += count;
            result.files.push(FileMatches { name, count });
        }

        result.lines = out.freeze();
        Ok(result)
    }

    fn name(&self) -> &'static str {
        "scan"
    }
}
