use crate::error::{FrameError, Result};

/// Byte sink a decoder or transport streams a frame into.
///
/// Writes go into the frame currently being assembled. Whether that frame is kept
/// or thrown away is decided by the concrete buffer once the boundary is known.
pub trait FrameWrite {
    /// Whether `len` more bytes fit in the current frame.
    fn can_write(&self, len: usize) -> bool;

    /// Append one byte to the current frame.
    fn write_byte(&mut self, byte: u8) -> Result<()>;

    /// Remove the last `len` written bytes from the current frame.
    fn undo_last_writes(&mut self, len: usize);

    /// Append `bytes` only if all of them fit.
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.can_write(bytes.len()) {
            return Err(FrameError::NoBufs);
        }
        for &byte in bytes {
            self.write_byte(byte)?;
        }
        Ok(())
    }
}

/// Buffer holding a single frame.
pub struct FrameBuffer<const N: usize> {
    buffer: [u8; N],
    write_pointer: usize,
}

impl<const N: usize> FrameBuffer<N> {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            buffer: [0; N],
            write_pointer: 0,
        }
    }

    /// Reset the write position to the start of the buffer.
    pub fn clear(&mut self) {
        self.write_pointer = 0;
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.write_pointer == 0
    }

    /// Number of bytes written.
    pub fn length(&self) -> usize {
        self.write_pointer
    }

    /// The frame written so far.
    pub fn frame(&self) -> &[u8] {
        &self.buffer[..self.write_pointer]
    }
}

impl<const N: usize> Default for FrameBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> FrameWrite for FrameBuffer<N> {
    fn can_write(&self, len: usize) -> bool {
        N - self.write_pointer >= len
    }

    fn write_byte(&mut self, byte: u8) -> Result<()> {
        if !self.can_write(1) {
            return Err(FrameError::NoBufs);
        }
        self.buffer[self.write_pointer] = byte;
        self.write_pointer += 1;
        Ok(())
    }

    fn undo_last_writes(&mut self, len: usize) {
        self.write_pointer -= len.min(self.write_pointer);
    }
}

const HEADER_TOTAL_LENGTH_OFFSET: usize = 0;
const HEADER_SKIP_LENGTH_OFFSET: usize = 2;
const HEADER_SIZE: usize = 4;

/// Buffer holding any number of saved frames plus one frame being written.
///
/// Every frame is preceded by a 4-byte header:
///
/// ```text
/// ┌────────────────┬───────────────┬──────────────┬───────────────┐
/// │ Total len (2B) │ Skip len (2B) │ Reserved     │ Frame bytes   │
/// │ LE             │ LE            │ (skip bytes) │               │
/// └────────────────┴───────────────┴──────────────┴───────────────┘
/// ```
///
/// The reserved region lets a transport read a bus header (e.g. SPI) in place ahead
/// of the frame without copying.
pub struct MultiFrameBuffer<const N: usize> {
    buffer: [u8; N],
    write_frame_start: usize,
    write_pointer: usize,
}

impl<const N: usize> MultiFrameBuffer<N> {
    /// Create an empty buffer.
    pub fn new() -> Self {
        let mut buffer = Self {
            buffer: [0; N],
            write_frame_start: 0,
            write_pointer: 0,
        };
        buffer.clear();
        buffer
    }

    /// Remove the current frame and every saved frame.
    pub fn clear(&mut self) {
        self.write_frame_start = 0;
        self.write_pointer = 0;
        let _ = self.set_skip_length(0);
    }

    /// Whether the current frame has any bytes.
    pub fn has_frame(&self) -> bool {
        self.write_pointer != self.frame_start()
    }

    /// Set the length of the current frame.
    pub fn set_length(&mut self, len: usize) -> Result<()> {
        let start = self.frame_start();
        if start + len > N {
            return Err(FrameError::NoBufs);
        }
        self.write_pointer = start + len;
        Ok(())
    }

    /// Length of the current frame.
    pub fn length(&self) -> usize {
        self.write_pointer - self.frame_start()
    }

    /// Reserve `skip` bytes in front of the current frame.
    ///
    /// Resets the current frame to empty.
    pub fn set_skip_length(&mut self, skip: usize) -> Result<()> {
        if self.write_frame_start + HEADER_SIZE + skip > N || skip > usize::from(u16::MAX) {
            return Err(FrameError::NoBufs);
        }
        self.write_u16(
            self.write_frame_start + HEADER_SKIP_LENGTH_OFFSET,
            skip as u16,
        );
        self.write_pointer = self.frame_start();
        Ok(())
    }

    /// Length of the reserved region in front of the current frame.
    pub fn skip_length(&self) -> usize {
        if self.header_fits() {
            usize::from(self.read_u16(self.write_frame_start + HEADER_SKIP_LENGTH_OFFSET))
        } else {
            0
        }
    }

    /// The current frame.
    pub fn frame(&self) -> &[u8] {
        &self.buffer[self.frame_start()..self.write_pointer]
    }

    /// The reserved region followed by the current frame's storage, up to the end
    /// of the buffer.
    pub fn reserved_and_frame_mut(&mut self) -> &mut [u8] {
        let start = if self.header_fits() {
            self.write_frame_start + HEADER_SIZE
        } else {
            N
        };
        &mut self.buffer[start..]
    }

    /// Largest length the current frame could grow to.
    pub fn frame_max_length(&self) -> usize {
        N - self.frame_start()
    }

    /// Keep the current frame and start a new, empty one after it.
    pub fn save_frame(&mut self) {
        if !self.header_fits() {
            return;
        }
        let total = self.skip_length() + self.length();
        self.write_u16(
            self.write_frame_start + HEADER_TOTAL_LENGTH_OFFSET,
            total as u16,
        );
        self.write_frame_start = self.write_pointer;
        self.start_empty_frame();
    }

    /// Throw away the current frame and start a new, empty one in its place.
    pub fn discard_frame(&mut self) {
        self.start_empty_frame();
    }

    /// Whether at least one frame has been saved.
    pub fn has_saved_frame(&self) -> bool {
        self.write_frame_start != 0
    }

    /// Iterate over saved frames, oldest first.
    pub fn saved_frames(&self) -> SavedFrames<'_, N> {
        SavedFrames {
            buffer: self,
            offset: 0,
        }
    }

    /// Drop all saved frames, moving the current frame to the start of the buffer.
    ///
    /// Slices previously obtained from [`frame`](Self::frame) or
    /// [`saved_frames`](Self::saved_frames) refer to stale content afterwards.
    pub fn clear_saved_frames(&mut self) {
        let shift = self.write_frame_start;
        if shift == 0 {
            return;
        }

        let header_fit = self.header_fits();
        self.buffer.copy_within(shift..self.write_pointer, 0);
        self.write_pointer -= shift;
        self.write_frame_start = 0;

        if !header_fit {
            self.start_empty_frame();
        }
    }

    fn start_empty_frame(&mut self) {
        if self.set_skip_length(0).is_err() {
            self.write_pointer = N;
        }
    }

    fn header_fits(&self) -> bool {
        self.write_frame_start + HEADER_SIZE <= N
    }

    fn frame_start(&self) -> usize {
        if self.header_fits() {
            self.write_frame_start + HEADER_SIZE + self.skip_length()
        } else {
            N
        }
    }

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.buffer[offset], self.buffer[offset + 1]])
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        self.buffer[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }
}

impl<const N: usize> Default for MultiFrameBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> FrameWrite for MultiFrameBuffer<N> {
    fn can_write(&self, len: usize) -> bool {
        N - self.write_pointer >= len
    }

    fn write_byte(&mut self, byte: u8) -> Result<()> {
        if !self.can_write(1) {
            return Err(FrameError::NoBufs);
        }
        self.buffer[self.write_pointer] = byte;
        self.write_pointer += 1;
        Ok(())
    }

    fn undo_last_writes(&mut self, len: usize) {
        self.write_pointer -= len.min(self.length());
    }
}

impl<const N: usize> std::fmt::Debug for MultiFrameBuffer<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiFrameBuffer")
            .field("capacity", &N)
            .field("write_frame_start", &self.write_frame_start)
            .field("frame_len", &self.length())
            .finish()
    }
}

/// Iterator over the saved frames of a [`MultiFrameBuffer`].
pub struct SavedFrames<'a, const N: usize> {
    buffer: &'a MultiFrameBuffer<N>,
    offset: usize,
}

impl<'a, const N: usize> Iterator for SavedFrames<'a, N> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset == self.buffer.write_frame_start {
            return None;
        }

        let total = usize::from(
            self.buffer
                .read_u16(self.offset + HEADER_TOTAL_LENGTH_OFFSET),
        );
        let skip = usize::from(self.buffer.read_u16(self.offset + HEADER_SKIP_LENGTH_OFFSET));
        let start = self.offset + HEADER_SIZE + skip;
        let end = self.offset + HEADER_SIZE + total;
        self.offset = end;

        Some(&self.buffer.buffer[start..end])
    }
}
