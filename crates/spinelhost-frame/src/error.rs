/// Errors that can occur while queueing, buffering or decoding frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Not enough free space in the buffer to hold the bytes.
    #[error("insufficient buffer space")]
    NoBufs,

    /// The frame is longer than the queue's one-byte length prefix can describe.
    #[error("frame too long ({len} bytes, max {max})")]
    FrameTooLong { len: usize, max: usize },

    /// A received HDLC frame failed its FCS check or was too short.
    #[error("malformed HDLC frame")]
    Parse,
}

pub type Result<T> = std::result::Result<T, FrameError>;
