use crate::error::{FrameError, Result};

/// Default backing size of a [`FrameQueue`].
pub const DEFAULT_QUEUE_SIZE: usize = 4096;

/// Largest frame a queue slot can describe with its one-byte length prefix.
pub const MAX_QUEUED_FRAME_LEN: usize = u8::MAX as usize;

/// Scratch space a caller lends to [`FrameQueue::shift`] for frames that wrap.
pub type ShiftScratch = [u8; MAX_QUEUED_FRAME_LEN];

/// FIFO of variable-length frames stored in a fixed ring of `N` bytes.
///
/// Wire layout inside the ring, repeated and free to wrap past the end of the array:
///
/// ```text
/// ┌──────────┬────────────────────┐
/// │ Len (1B) │ Payload (Len bytes)│
/// └──────────┴────────────────────┘
/// ```
///
/// One byte of the ring is never used so that `head == tail` always means empty.
pub struct FrameQueue<const N: usize = DEFAULT_QUEUE_SIZE> {
    buffer: [u8; N],
    head: usize,
    tail: usize,
}

impl<const N: usize> FrameQueue<N> {
    const VALID_SIZE: () = assert!(N >= 2, "frame queue needs at least two bytes");

    /// Create an empty queue.
    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID_SIZE;
        Self {
            buffer: [0; N],
            head: 0,
            tail: 0,
        }
    }

    /// Returns true when no frame is queued.
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Bytes currently occupied by queued frames, length prefixes included.
    pub fn used(&self) -> usize {
        (self.tail + N - self.head) % N
    }

    /// Bytes still available for new frames, length prefixes included.
    pub fn free_space(&self) -> usize {
        N - 1 - self.used()
    }

    /// Drop every queued frame.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Append a frame.
    ///
    /// Either the whole frame is stored or the queue is left untouched.
    pub fn push(&mut self, frame: &[u8]) -> Result<()> {
        let len = frame.len();
        if len > MAX_QUEUED_FRAME_LEN {
            return Err(FrameError::FrameTooLong {
                len,
                max: MAX_QUEUED_FRAME_LEN,
            });
        }
        if len + 1 > self.free_space() {
            return Err(FrameError::NoBufs);
        }

        self.buffer[self.tail] = len as u8;

        let start = (self.tail + 1) % N;
        let first = len.min(N - start);
        self.buffer[start..start + first].copy_from_slice(&frame[..first]);
        self.buffer[..len - first].copy_from_slice(&frame[first..]);

        self.tail = (start + len) % N;
        Ok(())
    }

    /// Remove the oldest frame and return its bytes.
    ///
    /// A frame stored contiguously is returned straight out of the ring; a frame that
    /// wraps is reassembled into `scratch`. Always read through the returned slice.
    /// The frame is consumed as soon as it is identified.
    pub fn shift<'a>(&'a mut self, scratch: &'a mut ShiftScratch) -> Option<&'a [u8]> {
        if self.is_empty() {
            return None;
        }

        let len = usize::from(self.buffer[self.head]);
        let start = (self.head + 1) % N;
        self.head = (start + len) % N;

        if start + len <= N {
            return Some(&self.buffer[start..start + len]);
        }

        let first = N - start;
        scratch[..first].copy_from_slice(&self.buffer[start..]);
        scratch[first..len].copy_from_slice(&self.buffer[..len - first]);
        Some(&scratch[..len])
    }
}

impl<const N: usize> Default for FrameQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> std::fmt::Debug for FrameQueue<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("capacity", &N)
            .field("head", &self.head)
            .field("tail", &self.tail)
            .finish()
    }
}
