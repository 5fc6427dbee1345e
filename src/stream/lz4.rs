//! Incremental LZ4 block decoder for the compressed-frame envelope.
//!
//! The server negotiates compression mid-session and then wraps the protocol
//! byte stream in `CompressedData` frames. Each frame is an LZ4 block whose
//! matches may reach back into previously decompressed frames, so the decoder
//! keeps a sliding history window across frames.

use crate::errors::Error;

/// Largest decompressed size a single frame may produce.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// History retained for cross-frame match offsets.
pub const WINDOW_SIZE: usize = 64 * 1024;

/// Matches shorter than this are not representable in the block format.
const MIN_MATCH: usize = 4;

#[derive(Debug, Default)]
pub struct Lz4Decoder {
    window: Vec<u8>,
}

impl Lz4Decoder {
    pub fn new() -> Lz4Decoder {
        Lz4Decoder {
            window: Vec::with_capacity(WINDOW_SIZE),
        }
    }

    /// Decompress one frame, appending its output to the history window.
    /// An empty payload yields zero bytes and leaves the window untouched.
    pub fn decompress(&mut self, src: &[u8]) -> Result<Vec<u8>, Error> {
        if src.is_empty() {
            return Ok(Vec::new());
        }

        let mut out: Vec<u8> = Vec::with_capacity(src.len() * 2);
        let mut pos = 0usize;

        loop {
            let token = *src.get(pos).ok_or_else(truncated)?;
            pos += 1;

            // Literal run.
            let mut literal_len = (token >> 4) as usize;
            if literal_len == 15 {
                literal_len = extend_length(src, &mut pos, literal_len)?;
            }
            if pos + literal_len > src.len() {
                return Err(truncated());
            }
            if out.len() + literal_len > MAX_MESSAGE_SIZE {
                return Err(Error::ProtocolViolation(format!(
                    "decompressed message exceeds {MAX_MESSAGE_SIZE} bytes"
                )));
            }
            out.extend_from_slice(&src[pos..pos + literal_len]);
            pos += literal_len;

            // The final sequence is literals only.
            if pos == src.len() {
                break;
            }

            if pos + 2 > src.len() {
                return Err(truncated());
            }
            let offset = u16::from_le_bytes([src[pos], src[pos + 1]]) as usize;
            pos += 2;
            if offset == 0 {
                return Err(Error::ProtocolViolation(
                    "compressed match offset of zero".into(),
                ));
            }

            let mut match_len = (token & 0x0f) as usize;
            if match_len == 15 {
                match_len = extend_length(src, &mut pos, match_len)?;
            }
            match_len += MIN_MATCH;

            if out.len() + match_len > MAX_MESSAGE_SIZE {
                return Err(Error::ProtocolViolation(format!(
                    "decompressed message exceeds {MAX_MESSAGE_SIZE} bytes"
                )));
            }
            self.copy_match(&mut out, offset, match_len)?;
        }

        self.window.extend_from_slice(&out);
        if self.window.len() > WINDOW_SIZE {
            let excess = self.window.len() - WINDOW_SIZE;
            self.window.drain(..excess);
        }
        Ok(out)
    }

    /// Copy `match_len` bytes from `offset` bytes back. The source may start
    /// in the history window and continue into the current output; an offset
    /// shorter than the match length repeats the produced bytes, which only
    /// the byte-wise copy renders correctly.
    fn copy_match(&self, out: &mut Vec<u8>, offset: usize, match_len: usize) -> Result<(), Error> {
        if offset > out.len() + self.window.len() {
            return Err(Error::ProtocolViolation(format!(
                "compressed match offset {offset} reaches past the history window"
            )));
        }

        if offset <= out.len() && offset >= match_len {
            // Disjoint source entirely inside the current output.
            let start = out.len() - offset;
            out.extend_from_within(start..start + match_len);
            return Ok(());
        }

        for _ in 0..match_len {
            let byte = if offset <= out.len() {
                out[out.len() - offset]
            } else {
                self.window[self.window.len() - (offset - out.len())]
            };
            out.push(byte);
        }
        Ok(())
    }
}

fn extend_length(src: &[u8], pos: &mut usize, base: usize) -> Result<usize, Error> {
    let mut len = base;
    loop {
        let byte = *src.get(*pos).ok_or_else(truncated)?;
        *pos += 1;
        len += byte as usize;
        if len > MAX_MESSAGE_SIZE * 2 {
            return Err(Error::ProtocolViolation(
                "compressed length field overflows the message bound".into(),
            ));
        }
        if byte != 255 {
            return Ok(len);
        }
    }
}

fn truncated() -> Error {
    Error::ProtocolViolation("compressed frame is truncated".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Hand-assembled LZ4 blocks: token = (literal_len << 4) | (match_len - 4).

    #[test]
    fn empty_payload_decompresses_to_nothing() {
        let mut dec = Lz4Decoder::new();
        assert_eq!(dec.decompress(&[]).unwrap(), Vec::<u8>::new());
        assert!(dec.window.is_empty());
    }

    #[test]
    fn literals_only() {
        let mut dec = Lz4Decoder::new();
        // token 0x50: five literals, final sequence.
        let out = dec.decompress(&[0x50, b'h', b'e', b'l', b'l', b'o']).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn disjoint_match_block_copies() {
        let mut dec = Lz4Decoder::new();
        // 4 literals "abcd", then a 4-byte match at offset 4 -> "abcdabcd",
        // then one trailing literal sequence "x".
        let src = [0x40, b'a', b'b', b'c', b'd', 0x04, 0x00, 0x10, b'x'];
        let out = dec.decompress(&src).unwrap();
        assert_eq!(out, b"abcdabcdx");
    }

    #[test]
    fn overlapping_match_repeats_pattern() {
        let mut dec = Lz4Decoder::new();
        // 1 literal "a", then an 8-byte match at offset 1: run-length "a"s.
        let src = [0x14, b'a', 0x01, 0x00, 0x40, b'z'];
        let out = dec.decompress(&src).unwrap();
        assert_eq!(out, b"aaaaaaaaaz");
    }

    #[test]
    fn match_reaches_into_previous_frame() {
        let mut dec = Lz4Decoder::new();
        dec.decompress(&[0x40, b'w', b'x', b'y', b'z']).unwrap();
        // No literals, 4-byte match at offset 4 = the previous frame's output.
        let out = dec.decompress(&[0x00, 0x04, 0x00, 0x10, b'!']).unwrap();
        assert_eq!(out, b"wxyz!");
    }

    #[test]
    fn zero_offset_is_protocol_violation() {
        let mut dec = Lz4Decoder::new();
        let src = [0x14, b'a', 0x00, 0x00, 0x40, b'z'];
        assert!(matches!(
            dec.decompress(&src),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn offset_past_window_is_protocol_violation() {
        let mut dec = Lz4Decoder::new();
        let src = [0x14, b'a', 0x09, 0x00, 0x40, b'z'];
        assert!(matches!(
            dec.decompress(&src),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn truncated_frame_is_protocol_violation() {
        let mut dec = Lz4Decoder::new();
        assert!(matches!(
            dec.decompress(&[0x50, b'a']),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn extended_literal_lengths() {
        // 15 + 240 literals, encoded with one extension byte.
        let mut payload = vec![0xF0, 240];
        payload.extend(std::iter::repeat(b'q').take(255));
        let mut dec = Lz4Decoder::new();
        let out = dec.decompress(&payload).unwrap();
        assert_eq!(out.len(), 255);
        assert!(out.iter().all(|&b| b == b'q'));
    }

    #[test]
    fn window_slides_past_capacity() {
        let mut dec = Lz4Decoder::new();
        // Push eighteen 4 KiB frames through; the window must cap at 64 KiB.
        for _ in 0..18 {
            let mut payload = Vec::new();
            let mut remaining = 4096usize;
            // literal length 4096 = 15 + extension bytes
            payload.push(0xF0);
            remaining -= 15;
            while remaining >= 255 {
                payload.push(255);
                remaining -= 255;
            }
            payload.push(remaining as u8);
            payload.extend(std::iter::repeat(b'r').take(4096));
            dec.decompress(&payload).unwrap();
        }
        assert_eq!(dec.window.len(), WINDOW_SIZE);
    }
}
