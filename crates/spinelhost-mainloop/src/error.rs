use std::os::fd::RawFd;

/// Errors that can occur while driving the mainloop.
#[derive(Debug, thiserror::Error)]
pub enum MainloopError {
    /// The `select()` call itself failed (anything other than `EINTR`).
    #[error("select failed: {0}")]
    Select(#[source] std::io::Error),

    /// The descriptor cannot be represented in an `fd_set`.
    #[error("file descriptor {fd} outside fd_set range (max {max})")]
    FdOutOfRange { fd: RawFd, max: usize },
}

pub type Result<T> = std::result::Result<T, MainloopError>;
