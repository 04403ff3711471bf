//! Growable FIFO byte buffer with SLIP framing support.
//!
//! A single owned byte array with independent read/write offsets, used both
//! to accumulate inbound bytes off the wire and to assemble outbound SLIP
//! frames. Unlike a plain `Vec<u8>`, consumers can `view()` the unread
//! region without copying, and `packet()` understands SLIP's `0xC0` framing
//! well enough to carve a single frame out of a stream that may contain
//! partial or multiple frames.

use crate::error::{Error, Result};

const SLIP_END: u8 = 0xC0;
const SLIP_ESC: u8 = 0xDB;
const SLIP_ESC_END: u8 = 0xDC;
const SLIP_ESC_ESC: u8 = 0xDD;

/// Byte order used by [`Buffer::pack`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Endianness {
    Little,
    Big,
}

/// A growable byte FIFO with SLIP encode/decode toggles.
///
/// `read_offset` and `write_offset` track the unread region `[read_offset,
/// write_offset)`. The backing storage grows geometrically, doubling (or
/// growing to fit whatever was just requested, if that's bigger) rather than
/// reallocating per byte.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    read_offset: usize,
    write_offset: usize,
    slip_encode: bool,
    slip_decode: bool,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer::default()
    }

    pub fn is_empty(&self) -> bool {
        self.read_offset == self.write_offset
    }

    pub fn len(&self) -> usize {
        self.write_offset - self.read_offset
    }

    /// Drop all buffered bytes and rewind both offsets. Does not shrink the
    /// backing allocation.
    pub fn clear(&mut self) {
        self.read_offset = 0;
        self.write_offset = 0;
    }

    /// Enable or disable SLIP escaping on subsequent writes.
    pub fn set_slip_encode(&mut self, enabled: bool) {
        self.slip_encode = enabled;
    }

    /// Enable or disable SLIP unescaping on subsequent reads via [`Buffer::packet`].
    pub fn set_slip_decode(&mut self, enabled: bool) {
        self.slip_decode = enabled;
    }

    fn ensure_capacity(&mut self, additional: usize) {
        let needed = self.write_offset + additional;
        if needed > self.data.len() {
            let grown = usize::max(self.data.len() * 2, needed);
            self.data.resize(grown, 0);
        }
    }

    /// Append raw bytes, applying SLIP escaping if enabled.
    pub fn push(&mut self, bytes: &[u8]) {
        if self.slip_encode {
            for &byte in bytes {
                match byte {
                    SLIP_END => self.push_raw(&[SLIP_ESC, SLIP_ESC_END]),
                    SLIP_ESC => self.push_raw(&[SLIP_ESC, SLIP_ESC_ESC]),
                    other => self.push_raw(&[other]),
                }
            }
        } else {
            self.push_raw(bytes);
        }
    }

    fn push_raw(&mut self, bytes: &[u8]) {
        self.ensure_capacity(bytes.len());
        let start = self.write_offset;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.write_offset += bytes.len();
    }

    /// Copy bytes from another buffer's unread region, applying SLIP escaping
    /// if enabled on `self`.
    pub fn copy(&mut self, other: &Buffer) {
        let view = other.view().to_vec();
        self.push(&view);
    }

    /// Append `count` copies of `byte`.
    pub fn fill(&mut self, byte: u8, count: usize) {
        let padding = vec![byte; count];
        self.push(&padding);
    }

    /// Pack integers according to a Python `struct`-like format string.
    ///
    /// `<`/`>` toggle endianness for the remainder of the string (default
    /// little); `B`/`H`/`I` pack 1/2/4-byte unsigned integers respectively.
    /// Big-endian packing is rejected outright rather than implemented: no
    /// call site in this crate ever needs it, and every integer on this wire
    /// protocol is little-endian.
    pub fn pack(&mut self, format: &str, args: &[u32]) -> Result<()> {
        let mut endianness = Endianness::Little;
        let mut arg_index = 0;

        for ch in format.chars() {
            match ch {
                '<' => endianness = Endianness::Little,
                '>' => endianness = Endianness::Big,
                'B' | 'H' | 'I' => {
                    let value = *args.get(arg_index).ok_or(Error::PackArgMismatch)?;
                    arg_index += 1;
                    let width = match ch {
                        'B' => 1,
                        'H' => 2,
                        'I' => 4,
                        _ => unreachable!(),
                    };
                    self.push_int(value, width, endianness)?;
                }
                _ => {}
            }
        }

        if arg_index != args.len() {
            return Err(Error::PackArgMismatch);
        }

        Ok(())
    }

    fn push_int(&mut self, value: u32, width: usize, endianness: Endianness) -> Result<()> {
        match endianness {
            Endianness::Big => Err(Error::UnsupportedEndianness),
            Endianness::Little => {
                let bytes = value.to_le_bytes();
                self.push(&bytes[..width]);
                Ok(())
            }
        }
    }

    /// Zero-copy view of the unread region.
    pub fn view(&self) -> &[u8] {
        &self.data[self.read_offset..self.write_offset]
    }

    /// Extract one SLIP-framed packet from the unread region, if a complete
    /// one is present. Advances `read_offset` past the closing frame byte on
    /// success. Returns `None` if fewer than two frame bytes are currently
    /// buffered.
    pub fn packet(&mut self) -> Option<Vec<u8>> {
        let view = self.view();
        let start = view.iter().position(|&b| b == SLIP_END)?;
        let end_rel = view[start + 1..].iter().position(|&b| b == SLIP_END)?;
        let end = start + 1 + end_rel;

        let mut packet = view[start + 1..end].to_vec();
        self.read_offset += end + 1;

        if self.slip_decode {
            unescape_in_place(&mut packet);
        }

        Some(packet)
    }
}

fn unescape_in_place(data: &mut Vec<u8>) {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter().copied();
    while let Some(byte) = iter.next() {
        if byte == SLIP_ESC {
            match iter.next() {
                Some(SLIP_ESC_END) => out.push(SLIP_END),
                Some(SLIP_ESC_ESC) => out.push(SLIP_ESC),
                Some(other) => {
                    out.push(SLIP_ESC);
                    out.push(other);
                }
                None => out.push(SLIP_ESC),
            }
        } else {
            out.push(byte);
        }
    }
    *data = out;
}

/// SLIP-encode a whole buffer of bytes into a standalone frame:
/// `0xC0 <escaped bytes> 0xC0`.
pub fn slip_encode(data: &[u8]) -> Vec<u8> {
    let mut buf = Buffer::new();
    buf.push(&[SLIP_END]);
    buf.set_slip_encode(true);
    buf.push(data);
    buf.set_slip_encode(false);
    buf.push(&[SLIP_END]);
    buf.view().to_vec()
}

/// SLIP-decode a single complete frame (including both `0xC0` bytes),
/// returning the unescaped payload between them.
pub fn slip_decode(frame: &[u8]) -> Option<Vec<u8>> {
    let mut buf = Buffer::new();
    buf.set_slip_decode(true);
    buf.push_raw(frame);
    buf.packet()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn slip_round_trip_is_identity_for_any_bytes() {
        for seed in 0u8..=255 {
            let data: Vec<u8> = (0..64).map(|i| seed.wrapping_mul(i).wrapping_add(i)).collect();
            let encoded = slip_encode(&data);
            assert_eq!(encoded.first(), Some(&SLIP_END));
            assert_eq!(encoded.last(), Some(&SLIP_END));
            for &b in &encoded[1..encoded.len() - 1] {
                // every interior END must have been escaped away
                if b == SLIP_END {
                    panic!("unescaped END byte in encoded frame");
                }
            }
            let decoded = slip_decode(&encoded).expect("a full frame should decode");
            assert_eq!(decoded, data);
        }
    }

    #[test]
    fn packet_returns_none_without_two_frame_bytes() {
        let mut buf = Buffer::new();
        buf.push_raw(&[SLIP_END, 1, 2, 3]);
        assert!(buf.packet().is_none());
    }

    #[test]
    fn packet_extracts_bytes_strictly_between_frames() {
        let mut buf = Buffer::new();
        buf.push_raw(&[SLIP_END, 1, 2, 3, SLIP_END, 9, 9]);
        let packet = buf.packet().expect("packet should be present");
        assert_eq!(packet, vec![1, 2, 3]);
        assert_eq!(buf.view(), &[9, 9]);
    }

    #[test]
    fn pack_little_endian_matches_wire_layout() {
        let mut buf = Buffer::new();
        buf.pack("<IIII", &[0x1122_3344, 0xAABB_CCDD, 1, 2]).unwrap();
        let expected: Vec<u8> = [0x1122_3344u32, 0xAABB_CCDDu32, 1, 2]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        assert_eq!(buf.view(), expected.as_slice());
    }

    #[test]
    fn pack_rejects_big_endian() {
        let mut buf = Buffer::new();
        assert!(matches!(
            buf.pack(">I", &[1]),
            Err(Error::UnsupportedEndianness)
        ));
    }

    #[test]
    fn pack_rejects_mismatched_arg_count() {
        let mut buf = Buffer::new();
        assert!(matches!(
            buf.pack("<II", &[1]),
            Err(Error::PackArgMismatch)
        ));
    }

    #[test]
    fn fill_appends_repeated_byte() {
        let mut buf = Buffer::new();
        buf.fill(0xFF, 4);
        assert_eq!(buf.view(), &[0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn clear_resets_offsets_but_keeps_capacity() {
        let mut buf = Buffer::new();
        buf.push_raw(&[1, 2, 3]);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
    }
}
