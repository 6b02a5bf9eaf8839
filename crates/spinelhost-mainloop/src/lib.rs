//! Cooperative single-threaded I/O multiplexing.
//!
//! Every component owning a file descriptor implements [`Source`] and registers once
//! with the [`Manager`]. Each iteration the [`Mainloop`]:
//!
//! 1. builds a fresh [`Context`] and lets every source add its fds and shrink the timeout,
//! 2. performs exactly one `select()`,
//! 3. lets every source react to the readiness it asked about.
//!
//! Sources are visited in registration order, once per phase. Nothing here is `Send`:
//! the loop and all of its sources live on one thread.

pub mod context;
pub mod error;
pub mod manager;
pub mod select;

pub use context::{Context, FdSet, DEFAULT_TIMEOUT};
pub use error::{MainloopError, Result};
pub use manager::{Manager, Source, SourceId};
pub use select::{deadline_after, wait_fd, Interest, Mainloop, MAX_WAIT};
