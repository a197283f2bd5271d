//! fleet-grep: search log files across many machines from one place.
//!
//! A client broadcasts a query such as `search ['ERROR', 'timeout']` to a
//! set of log servers. Each server searches its local log file or directory
//! and answers with a header line and the matching lines; the client adds
//! up the per-server counts.
//!
//! Components:
//! - `protocol`: request/response wire codec
//! - `matcher`: search engines behind the `Matcher` trait
//! - `handler`: one query per connection
//! - `runtime`: single-threaded connection multiplexers (mio or tokio)
//! - `fanout`: concurrent client with per-server failure isolation
//! - `config`: CLI and TOML configuration

pub mod config;
pub mod fanout;
pub mod handler;
pub mod matcher;
pub mod protocol;
pub mod runtime;
