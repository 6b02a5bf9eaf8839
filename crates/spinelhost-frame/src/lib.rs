//! Frame buffering for spinel transports.
//!
//! Three building blocks live here:
//! - [`FrameQueue`]: a fixed-size ring of length-prefixed frames (FIFO, wrap-around safe)
//! - [`MultiFrameBuffer`]: the byte-granular receive buffer transports stream into,
//!   committing or discarding a frame once its boundary is known
//! - [`hdlc`]: HDLC-lite encoding and a streaming decoder for UART links
//!
//! Nothing here locks. Every type is owned by exactly one transport and mutated from
//! the mainloop thread only.

pub mod buffer;
pub mod error;
pub mod hdlc;
pub mod queue;

pub use buffer::{FrameBuffer, FrameWrite, MultiFrameBuffer, SavedFrames};
pub use error::{FrameError, Result};
pub use queue::{FrameQueue, ShiftScratch, DEFAULT_QUEUE_SIZE, MAX_QUEUED_FRAME_LEN};

/// Largest spinel frame any transport accepts or delivers.
pub const MAX_FRAME_SIZE: usize = 2048;

/// Receive buffer shared between a transport and its receive callback.
pub type RxFrameBuffer = MultiFrameBuffer<MAX_FRAME_SIZE>;
