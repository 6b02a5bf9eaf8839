//! HDLC-lite framing used on UART links to the RCP.
//!
//! ```text
//! ┌──────┬────────────────────────┬──────────────────┬──────┐
//! │ 0x7E │ escaped payload        │ escaped FCS (LE) │ 0x7E │
//! └──────┴────────────────────────┴──────────────────┴──────┘
//! ```
//!
//! The FCS is the reflected CRC-CCITT (poly 0x8408) seeded with 0xFFFF and sent
//! complemented.

use bytes::{BufMut, BytesMut};
use tracing::trace;

use crate::buffer::FrameWrite;
use crate::error::{FrameError, Result};

pub const FLAG_SEQUENCE: u8 = 0x7E;
pub const ESCAPE_SEQUENCE: u8 = 0x7D;
pub const ESCAPE_XOR: u8 = 0x20;

const FLAG_XON: u8 = 0x11;
const FLAG_XOFF: u8 = 0x13;
const FLAG_SPECIAL: u8 = 0xF8;

const INIT_FCS: u16 = 0xFFFF;
const GOOD_FCS: u16 = 0xF0B8;
const FCS_SIZE: usize = 2;

fn update_fcs(fcs: u16, byte: u8) -> u16 {
    let mut fcs = fcs ^ u16::from(byte);
    for _ in 0..8 {
        fcs = if fcs & 1 != 0 {
            (fcs >> 1) ^ 0x8408
        } else {
            fcs >> 1
        };
    }
    fcs
}

fn needs_escape(byte: u8) -> bool {
    matches!(
        byte,
        FLAG_SEQUENCE | ESCAPE_SEQUENCE | FLAG_XON | FLAG_XOFF | FLAG_SPECIAL
    )
}

fn put_escaped(dst: &mut BytesMut, byte: u8) {
    if needs_escape(byte) {
        dst.put_u8(ESCAPE_SEQUENCE);
        dst.put_u8(byte ^ ESCAPE_XOR);
    } else {
        dst.put_u8(byte);
    }
}

/// Encode `payload` as one HDLC-lite frame appended to `dst`.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) {
    // Worst case every byte is escaped.
    dst.reserve(2 * (payload.len() + FCS_SIZE) + 2);
    dst.put_u8(FLAG_SEQUENCE);

    let mut fcs = INIT_FCS;
    for &byte in payload {
        fcs = update_fcs(fcs, byte);
        put_escaped(dst, byte);
    }

    let fcs = (fcs ^ 0xFFFF).to_le_bytes();
    put_escaped(dst, fcs[0]);
    put_escaped(dst, fcs[1]);
    dst.put_u8(FLAG_SEQUENCE);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NoSync,
    Sync,
    Escaped,
}

/// Streaming HDLC-lite decoder.
///
/// Decoded bytes go straight into the caller's [`FrameWrite`] sink. At every closing
/// flag the handler is told whether the bytes written since the previous flag form a
/// valid frame (FCS already removed) or must be discarded.
#[derive(Debug)]
pub struct Decoder {
    state: State,
    fcs: u16,
    decoded_len: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: State::NoSync,
            fcs: INIT_FCS,
            decoded_len: 0,
        }
    }

    /// Drop any partial frame state and wait for the next flag.
    pub fn reset(&mut self) {
        self.state = State::NoSync;
        self.fcs = INIT_FCS;
        self.decoded_len = 0;
    }

    /// Feed raw link bytes.
    ///
    /// `on_frame` receives the sink and `Ok(())` for each valid frame, `Err(Parse)` for a
    /// frame with a bad FCS, or `Err(NoBufs)` when the sink filled up mid-frame.
    pub fn decode<W, F>(&mut self, data: &[u8], sink: &mut W, mut on_frame: F)
    where
        W: FrameWrite,
        F: FnMut(&mut W, Result<()>),
    {
        for &byte in data {
            match self.state {
                State::NoSync => {
                    if byte == FLAG_SEQUENCE {
                        self.start_frame();
                    }
                }
                State::Sync => match byte {
                    ESCAPE_SEQUENCE => self.state = State::Escaped,
                    FLAG_SEQUENCE => {
                        if self.decoded_len > 0 {
                            let result = if self.decoded_len >= FCS_SIZE && self.fcs == GOOD_FCS {
                                sink.undo_last_writes(FCS_SIZE);
                                Ok(())
                            } else {
                                trace!(len = self.decoded_len, fcs = self.fcs, "bad hdlc frame");
                                Err(FrameError::Parse)
                            };
                            on_frame(sink, result);
                        }
                        self.start_frame();
                    }
                    _ => self.push(byte, sink, &mut on_frame),
                },
                State::Escaped => {
                    self.state = State::Sync;
                    self.push(byte ^ ESCAPE_XOR, sink, &mut on_frame);
                }
            }
        }
    }

    fn start_frame(&mut self) {
        self.state = State::Sync;
        self.fcs = INIT_FCS;
        self.decoded_len = 0;
    }

    fn push<W, F>(&mut self, byte: u8, sink: &mut W, on_frame: &mut F)
    where
        W: FrameWrite,
        F: FnMut(&mut W, Result<()>),
    {
        if sink.write_byte(byte).is_ok() {
            self.fcs = update_fcs(self.fcs, byte);
            self.decoded_len += 1;
        } else {
            on_frame(sink, Err(FrameError::NoBufs));
            self.reset();
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{FrameBuffer, MultiFrameBuffer};

    const MOTTO: &[u8] = b"Think good thoughts, say good words, do good deeds!";

    fn decode_all(wire: &[u8]) -> (Vec<Vec<u8>>, Vec<FrameError>) {
        let mut decoder = Decoder::new();
        let mut sink = MultiFrameBuffer::<512>::new();
        let mut frames = Vec::new();
        let mut errors = Vec::new();

        decoder.decode(wire, &mut sink, |sink, result| match result {
            Ok(()) => {
                frames.push(sink.frame().to_vec());
                sink.discard_frame();
            }
            Err(err) => {
                errors.push(err);
                sink.discard_frame();
            }
        });

        (frames, errors)
    }

    #[test]
    fn fcs_of_known_vector() {
        // "123456789" -> 0x906E for CRC-16/X-25 (complemented output).
        let fcs = b"123456789".iter().fold(INIT_FCS, |f, &b| update_fcs(f, b));
        assert_eq!(fcs ^ 0xFFFF, 0x906E);
    }

    #[test]
    fn encoded_frame_decodes_to_payload() {
        let mut wire = BytesMut::new();
        encode_frame(MOTTO, &mut wire);
        assert_eq!(wire[0], FLAG_SEQUENCE);
        assert_eq!(wire[wire.len() - 1], FLAG_SEQUENCE);

        let (frames, errors) = decode_all(&wire);
        assert!(errors.is_empty());
        assert_eq!(frames, vec![MOTTO.to_vec()]);
    }

    #[test]
    fn special_bytes_are_escaped_on_the_wire() {
        let payload = [FLAG_SEQUENCE, ESCAPE_SEQUENCE, FLAG_XON, FLAG_XOFF, FLAG_SPECIAL, 0x00];
        let mut wire = BytesMut::new();
        encode_frame(&payload, &mut wire);

        let body = &wire[1..wire.len() - 1];
        assert!(!body.contains(&FLAG_SEQUENCE));
        assert!(!body.contains(&FLAG_XON));

        let (frames, _) = decode_all(&wire);
        assert_eq!(frames, vec![payload.to_vec()]);
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut wire = BytesMut::new();
        encode_frame(b"one", &mut wire);
        encode_frame(b"two", &mut wire);

        let (frames, errors) = decode_all(&wire);
        assert!(errors.is_empty());
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn corrupted_frame_reports_parse_error() {
        let mut wire = BytesMut::new();
        encode_frame(b"hello", &mut wire);
        wire[2] ^= 0x01;

        let (frames, errors) = decode_all(&wire);
        assert!(frames.is_empty());
        assert_eq!(errors, vec![FrameError::Parse]);
    }

    #[test]
    fn leading_garbage_before_first_flag_is_ignored() {
        let mut wire = BytesMut::from(&b"\x01\x02garbage"[..]);
        encode_frame(b"payload", &mut wire);

        let (frames, errors) = decode_all(&wire);
        assert!(errors.is_empty());
        assert_eq!(frames, vec![b"payload".to_vec()]);
    }

    #[test]
    fn byte_at_a_time_feeding() {
        let mut wire = BytesMut::new();
        encode_frame(MOTTO, &mut wire);

        let mut decoder = Decoder::new();
        let mut sink = FrameBuffer::<128>::new();
        let mut got = None;
        for byte in wire.iter() {
            decoder.decode(std::slice::from_ref(byte), &mut sink, |sink, result| {
                assert!(result.is_ok());
                got = Some(sink.frame().to_vec());
            });
        }
        assert_eq!(got.as_deref(), Some(MOTTO));
    }

    #[test]
    fn full_sink_reports_no_bufs_and_resyncs() {
        let mut wire = BytesMut::new();
        encode_frame(&[0xAA; 32], &mut wire);
        encode_frame(b"ok", &mut wire);

        let mut decoder = Decoder::new();
        let mut sink = FrameBuffer::<16>::new();
        let mut results = Vec::new();
        decoder.decode(&wire, &mut sink, |sink, result| {
            results.push(result.map(|()| sink.frame().to_vec()));
            sink.clear();
        });

        assert_eq!(results, vec![Err(FrameError::NoBufs), Ok(b"ok".to_vec())]);
    }
}
