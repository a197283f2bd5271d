//! Wire codec for the single-shot log search protocol.
//!
//! One request and one response per TCP connection:
//!
//! ```text
//! Request:  search ['error', 'timeout']
//! Response: machine.log: 2\n
//!           <matched line>\n
//!           <matched line>\n
//!           <close>
//! ```
//!
//! A request that does not follow the `search <list of strings>` grammar gets
//! a single diagnostic line instead of a header, and so does a search whose
//! matcher failed.

use crate::matcher::MatchResult;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Largest request read from a connection. Anything beyond is dropped.
pub const MAX_QUERY_SIZE: usize = 5120;

/// Literal every request starts with.
pub const QUERY_PREFIX: &str = "search ";

/// Body sent back for a request that does not parse.
pub const MALFORMED_QUERY_MESSAGE: &str =
    "invalid query: expected search ['<query string 1>', '<query string 2>']";

/// Body sent back when the matcher could not run.
pub const COMMAND_FAILED_MESSAGE: &str = "command failed";

/// A parsed search request: match a line if any term matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    terms: Vec<String>,
}

impl Query {
    /// Build a query from its terms. At least one term is required.
    pub fn new(terms: Vec<String>) -> Result<Self, MalformedQuery> {
        if terms.is_empty() {
            return Err(MalformedQuery::EmptyList);
        }
        Ok(Self { terms })
    }

    pub fn terms(&self) -> &[String] {
        &self.terms
    }
}

/// Why a request was rejected. Every variant is reported to the peer with
/// the same fixed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedQuery {
    /// Request bytes are not UTF-8.
    NotUtf8,
    /// Request does not start with `search `.
    MissingPrefix,
    /// The term list could not be parsed.
    InvalidList(String),
    /// The term list parsed but holds no terms.
    EmptyList,
}

impl fmt::Display for MalformedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedQuery::NotUtf8 => write!(f, "request is not valid UTF-8"),
            MalformedQuery::MissingPrefix => write!(f, "request does not start with '{QUERY_PREFIX}'"),
            MalformedQuery::InvalidList(reason) => write!(f, "invalid term list: {reason}"),
            MalformedQuery::EmptyList => write!(f, "term list is empty"),
        }
    }
}

impl std::error::Error for MalformedQuery {}

/// Parse request bytes into a [`Query`].
pub fn decode(input: &[u8]) -> Result<Query, MalformedQuery> {
    let text = std::str::from_utf8(input).map_err(|_| MalformedQuery::NotUtf8)?;
    let rest = text
        .strip_prefix(QUERY_PREFIX)
        .ok_or(MalformedQuery::MissingPrefix)?;
    let terms = ListParser::new(rest).parse()?;
    Query::new(terms)
}

/// Encode the diagnostic for a rejected request. No header line.
pub fn encode_error(_err: &MalformedQuery) -> Bytes {
    Bytes::from_static(MALFORMED_QUERY_MESSAGE.as_bytes())
}

/// Encode the placeholder for a failed matcher run. No header line.
pub fn encode_command_failed() -> Bytes {
    Bytes::from_static(COMMAND_FAILED_MESSAGE.as_bytes())
}

/// How the header line is written when the log source is a directory.
///
/// `Names` is the historical format and lists file names only, unlike the
/// single-file header which always carries the count. `Counted` appends the
/// total the same way the single-file header does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryHeader {
    #[default]
    Names,
    Counted,
}

/// Encode a successful search: header line then the matched lines.
pub fn encode_success(result: &MatchResult, directory_header: DirectoryHeader) -> Bytes {
    let names = result
        .files
        .iter()
        .map(|f| f.name.as_str())
        .collect::<Vec<_>>()
        .join(",");

    let header = if result.multi_file && directory_header == DirectoryHeader::Names {
        format!("{names}\n")
    } else {
        format!("{names}: {}\n", result.total)
    };

    let mut out = BytesMut::with_capacity(header.len() + result.lines.len());
    out.put_slice(header.as_bytes());
    out.put_slice(&result.lines);
    out.freeze()
}

/// Header line of a success response as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    pub files: Vec<String>,
    /// Total count, when the header carries one.
    pub count: Option<usize>,
}

/// Parse the first line of a response.
///
/// Returns `None` for the fixed diagnostics, which are not headers.
pub fn parse_header(line: &str) -> Option<ResponseHeader> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);

    if line == MALFORMED_QUERY_MESSAGE || line == COMMAND_FAILED_MESSAGE {
        return None;
    }

    let split_names = |names: &str| -> Vec<String> {
        names
            .split(',')
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect()
    };

    if let Some((names, count)) = line.rsplit_once(": ") {
        if let Ok(count) = count.trim().parse::<usize>() {
            return Some(ResponseHeader {
                files: split_names(names),
                count: Some(count),
            });
        }
    }

    Some(ResponseHeader {
        files: split_names(line),
        count: None,
    })
}

/// Match count the way older clients derive it: every received line except
/// the header is a match.
pub fn legacy_count(lines_received: usize) -> usize {
    lines_received.saturating_sub(1)
}

/// Parser for a bracketed list of Python-style string literals:
/// `['a', "b", r'\d+', 'ERR' 'OR']`.
///
/// Literals take an optional `r`/`u` prefix in either case and may be
/// triple-quoted. Adjacent literals inside one element are joined.
struct ListParser {
    chars: Vec<char>,
    pos: usize,
}

impl ListParser {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn parse(mut self) -> Result<Vec<String>, MalformedQuery> {
        self.skip_whitespace();
        self.expect('[')?;

        let mut terms = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek() == Some(']') {
                self.pos += 1;
                break;
            }
            terms.push(self.term()?);
            self.skip_whitespace();
            match self.bump() {
                Some(',') => continue,
                Some(']') => break,
                Some(c) => return Err(invalid(format!("unexpected '{c}' after term"))),
                None => return Err(invalid("unterminated list")),
            }
        }

        self.skip_whitespace();
        if let Some(c) = self.peek() {
            return Err(invalid(format!("trailing input starting at '{c}'")));
        }
        Ok(terms)
    }

    /// One list element: a literal followed by any adjacent literals.
    fn term(&mut self) -> Result<String, MalformedQuery> {
        let mut term = match self.literal_prefix() {
            Some(prefix) => self.literal(prefix)?,
            None => {
                return Err(match self.peek() {
                    Some(c) => invalid(format!("expected string literal, found '{c}'")),
                    None => invalid("unterminated list"),
                })
            }
        };
        loop {
            self.skip_whitespace();
            match self.literal_prefix() {
                Some(prefix) => term.push_str(&self.literal(prefix)?),
                None => return Ok(term),
            }
        }
    }

    /// The prefix of the literal starting here, if one does.
    fn literal_prefix(&self) -> Option<Option<char>> {
        match (self.peek()?, self.peek_at(1)) {
            ('\'' | '"', _) => Some(None),
            (p @ ('r' | 'R' | 'u' | 'U'), Some('\'' | '"')) => Some(Some(p)),
            _ => None,
        }
    }

    fn literal(&mut self, prefix: Option<char>) -> Result<String, MalformedQuery> {
        let raw = matches!(prefix, Some('r' | 'R'));
        if prefix.is_some() {
            self.pos += 1;
        }
        let quote = self.bump().ok_or_else(unterminated)?;
        let triple = self.at_quotes(quote);
        if triple {
            self.pos += 2;
        }

        let mut out = String::new();
        loop {
            match self.bump().ok_or_else(unterminated)? {
                c if c == quote => {
                    if !triple {
                        return Ok(out);
                    }
                    if self.at_quotes(quote) {
                        self.pos += 2;
                        return Ok(out);
                    }
                    out.push(c);
                }
                '\n' if !triple => return Err(unterminated()),
                '\\' => {
                    let next = self.bump().ok_or_else(unterminated)?;
                    if raw {
                        // The quote after a backslash never ends a raw literal.
                        out.push('\\');
                        out.push(next);
                    } else {
                        self.escape(next, &mut out)?;
                    }
                }
                c => out.push(c),
            }
        }
    }

    /// Decode the escape whose backslash and first character `c` were consumed.
    fn escape(&mut self, c: char, out: &mut String) -> Result<(), MalformedQuery> {
        let decoded = match c {
            // Line continuation.
            '\n' => return Ok(()),
            '\\' | '\'' | '"' => c,
            'a' => '\x07',
            'b' => '\x08',
            'f' => '\x0c',
            'n' => '\n',
            'r' => '\r',
            't' => '\t',
            'v' => '\x0b',
            '0'..='7' => {
                let mut value = c as u32 - '0' as u32;
                for _ in 0..2 {
                    match self.peek().and_then(|d| d.to_digit(8)) {
                        Some(d) => {
                            value = value * 8 + d;
                            self.pos += 1;
                        }
                        None => break,
                    }
                }
                code_point(value)?
            }
            'x' => self.hex_escape(2)?,
            'u' => self.hex_escape(4)?,
            'U' => self.hex_escape(8)?,
            'N' => return Err(invalid("named unicode escapes are not supported")),
            // Unknown escapes keep the backslash.
            other => {
                out.push('\\');
                other
            }
        };
        out.push(decoded);
        Ok(())
    }

    /// Exactly `digits` hex digits naming a code point.
    fn hex_escape(&mut self, digits: usize) -> Result<char, MalformedQuery> {
        let mut value = 0u32;
        for _ in 0..digits {
            let d = self
                .peek()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| invalid(format!("truncated escape, expected {digits} hex digits")))?;
            value = value * 16 + d;
            self.pos += 1;
        }
        code_point(value)
    }

    /// Whether the next two characters are both `quote`.
    fn at_quotes(&self, quote: char) -> bool {
        self.peek() == Some(quote) && self.peek_at(1) == Some(quote)
    }

    fn expect(&mut self, want: char) -> Result<(), MalformedQuery> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(c) => Err(invalid(format!("expected '{want}', found '{c}'"))),
            None => Err(invalid(format!("expected '{want}'"))),
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }
}

fn code_point(value: u32) -> Result<char, MalformedQuery> {
    char::from_u32(value).ok_or_else(|| invalid(format!("escape out of range: {value:#x}")))
}

fn unterminated() -> MalformedQuery {
    invalid("unterminated string literal")
}

fn invalid(reason: impl Into<String>) -> MalformedQuery {
    MalformedQuery::InvalidList(reason.into())
}
