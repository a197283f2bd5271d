//! Task-based multiplexer.
//!
//! Cooperative scheduling on a current-thread Tokio runtime: one task per
//! connection, all polled by a single thread.

mod task_loop;

pub use task_loop::TaskServer;
