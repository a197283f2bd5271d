//! mio-based multiplexer.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS) driven
//! from a single thread.

mod event_loop;

pub use event_loop::EventLoop;
