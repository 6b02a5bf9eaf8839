use spinelhost_frame::FrameError;
use spinelhost_mainloop::MainloopError;

/// Errors returned by spinel transports.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// `init` was called on a transport that is already open.
    #[error("transport already initialized")]
    Already,

    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgs(String),

    /// The channel reported a failure it could not classify further.
    #[error("transport failed: {0}")]
    Failed(String),

    /// The frame does not fit, or the channel ran out of buffers.
    #[error("insufficient buffer space")]
    NoBufs,

    /// A previous transmission is still in flight.
    #[error("transport busy")]
    Busy,

    /// Nothing arrived before the wait deadline.
    #[error("timed out waiting for a frame")]
    ResponseTimeout,

    /// The radio URL could not be parsed or carries a bad parameter.
    #[error("invalid radio url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The URL names a transport this build does not provide.
    #[error("unsupported transport: {0}")]
    Unsupported(String),

    /// An I/O error occurred on the underlying channel.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The bounded reconnect loop gave up.
    #[error("reconnect failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl From<FrameError> for TransportError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::NoBufs | FrameError::FrameTooLong { .. } => TransportError::NoBufs,
            FrameError::Parse => TransportError::Failed(err.to_string()),
        }
    }
}

impl From<MainloopError> for TransportError {
    fn from(err: MainloopError) -> Self {
        match err {
            MainloopError::Select(source) => TransportError::Io(source),
            other => TransportError::InvalidArgs(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
