//! Wire-level command framing for the ROM bootloader protocol.
//!
//! Every command is a single SLIP frame:
//!
//! ```text
//! 0xC0 | 0x00 | opcode | u16_le length | u32_le checksum | payload... | 0xC0
//! ```
//!
//! and every response is a SLIP frame of the same shape with the direction
//! byte set to `0x01` and `value`/`data` in place of `checksum`/`payload`.
//! This module only knows how to serialize the outbound half; matching a
//! response to its request and decoding `value`/`data` is
//! [`crate::loader::Loader::check_command`]'s job, since it needs the
//! [`crate::reader::Reader`] to wait for bytes.

use std::time::Duration;

use crate::buffer::Buffer;

/// Fixed baud rate the ROM bootloader always starts at, regardless of what
/// the chip's UART was last configured to.
pub const ESP_ROM_BAUD: u32 = 115200;

/// Flash erase granularity assumed by the erase-size workaround.
pub const FLASH_SECTOR_SIZE: u32 = 0x1000;

const CHECKSUM_INIT: u8 = 0xEF;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
const MEM_END_TIMEOUT: Duration = Duration::from_millis(50);
const ERASE_CHIP_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_TIMEOUT: Duration = Duration::from_secs(600);
const ERASE_REGION_TIMEOUT_PER_MB_MS: u64 = 30_000;

/// The 36-byte fixed payload sent with every `SYNC` attempt:
/// `0x07 0x07 0x12 0x20` followed by 32 bytes of `0x55`.
pub const SYNC_FRAME: [u8; 36] = {
    let mut frame = [0x55u8; 36];
    frame[0] = 0x07;
    frame[1] = 0x07;
    frame[2] = 0x12;
    frame[3] = 0x20;
    frame
};

/// XOR checksum used for flash/memory data blocks, starting from
/// [`CHECKSUM_INIT`].
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(CHECKSUM_INIT, |acc, &b| acc ^ b)
}

/// Opcodes understood by this driver. Only the subset named in scope: image
/// encryption, deflate streaming, read-back and chip-specific extras the ROM
/// exposes beyond ESP32/ESP32-S2/ESP8266 are not implemented.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Opcode {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,
    SpiSetParams = 0x0B,
    SpiAttach = 0x0D,
    ChangeBaudrate = 0x0F,
    EraseFlash = 0xD0,
}

impl Opcode {
    pub fn timeout(&self) -> Duration {
        match self {
            Opcode::Sync => SYNC_TIMEOUT,
            Opcode::MemEnd => MEM_END_TIMEOUT,
            Opcode::EraseFlash => ERASE_CHIP_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// A timeout proportional to `size` bytes, used for `FLASH_BEGIN`
    /// (erasing the region about to be written). Floored at the default
    /// timeout and capped at [`MAX_TIMEOUT`].
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        match self {
            Opcode::FlashBegin => {
                let mb = size as f64 / 1_000_000.0;
                let scaled = Duration::from_millis((ERASE_REGION_TIMEOUT_PER_MB_MS as f64 * mb) as u64);
                scaled.clamp(DEFAULT_TIMEOUT, MAX_TIMEOUT)
            }
            _ => self.timeout().min(MAX_TIMEOUT),
        }
    }
}

/// A fully-formed outbound command, ready to be SLIP-encoded and written to
/// the transport by the loader's command layer.
pub struct Command {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl Command {
    fn basic(opcode: Opcode, payload: Vec<u8>) -> Self {
        Command {
            opcode,
            payload,
            checksum: 0,
        }
    }

    pub fn sync() -> Self {
        Command::basic(Opcode::Sync, SYNC_FRAME.to_vec())
    }

    pub fn read_reg(address: u32) -> Self {
        Command::basic(Opcode::ReadReg, address.to_le_bytes().to_vec())
    }

    pub fn write_reg(address: u32, value: u32, mask: u32, delay_us: u32) -> Self {
        let mut buf = Buffer::new();
        buf.pack("<IIII", &[address, value, mask, delay_us])
            .expect("fixed-arity pack cannot mismatch");
        Command::basic(Opcode::WriteReg, buf.view().to_vec())
    }

    pub fn mem_begin(size: u32, blocks: u32, block_size: u32, offset: u32) -> Self {
        let mut buf = Buffer::new();
        buf.pack("<IIII", &[size, blocks, block_size, offset])
            .expect("fixed-arity pack cannot mismatch");
        Command::basic(Opcode::MemBegin, buf.view().to_vec())
    }

    pub fn mem_data(data: &[u8], sequence: u32) -> Self {
        data_command(Opcode::MemData, data, sequence)
    }

    pub fn mem_end(entry: u32) -> Self {
        let no_entry = u32::from(entry == 0);
        let mut buf = Buffer::new();
        buf.pack("<II", &[no_entry, entry])
            .expect("fixed-arity pack cannot mismatch");
        Command::basic(Opcode::MemEnd, buf.view().to_vec())
    }

    pub fn flash_data(data: &[u8], sequence: u32) -> Self {
        data_command(Opcode::FlashData, data, sequence)
    }

    pub fn flash_end(reboot: bool) -> Self {
        let mut buf = Buffer::new();
        buf.pack("<I", &[u32::from(!reboot)])
            .expect("fixed-arity pack cannot mismatch");
        Command::basic(Opcode::FlashEnd, buf.view().to_vec())
    }

    pub fn spi_set_params(params: &[u8; 24]) -> Self {
        Command::basic(Opcode::SpiSetParams, params.to_vec())
    }

    pub fn spi_attach(params: u32) -> Self {
        let mut buf = Buffer::new();
        buf.pack("<II", &[params, 0]).expect("fixed-arity pack cannot mismatch");
        Command::basic(Opcode::SpiAttach, buf.view().to_vec())
    }

    pub fn change_baudrate(new_baud: u32, prior_baud: u32) -> Self {
        let mut buf = Buffer::new();
        buf.pack("<II", &[new_baud, prior_baud])
            .expect("fixed-arity pack cannot mismatch");
        Command::basic(Opcode::ChangeBaudrate, buf.view().to_vec())
    }

    pub fn erase_flash() -> Self {
        Command::basic(Opcode::EraseFlash, Vec::new())
    }

    /// SLIP-encode this command for writing to the transport.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.push(&[0xC0]);
        buf.set_slip_encode(true);
        buf.push(&[0x00, self.opcode as u8]);
        buf.push(&(self.payload.len() as u16).to_le_bytes());
        buf.push(&self.checksum.to_le_bytes());
        buf.push(&self.payload);
        buf.set_slip_encode(false);
        buf.push(&[0xC0]);
        buf.view().to_vec()
    }
}

/// Build a `FLASH_DATA`/`MEM_DATA` payload: `<IIII>(len, seq, 0, 0)` followed
/// by the block bytes, with the command's checksum set to the XOR of the
/// unpadded block.
fn data_command(opcode: Opcode, data: &[u8], sequence: u32) -> Command {
    let mut buf = Buffer::new();
    buf.pack("<IIII", &[data.len() as u32, sequence, 0, 0])
        .expect("fixed-arity pack cannot mismatch");
    buf.push(data);
    Command {
        opcode,
        payload: buf.view().to_vec(),
        checksum: checksum(data) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sync_frame_matches_fixed_layout() {
        assert_eq!(SYNC_FRAME[0..4], [0x07, 0x07, 0x12, 0x20]);
        assert!(SYNC_FRAME[4..].iter().all(|&b| b == 0x55));
    }

    #[test]
    fn checksum_starts_from_0xef_and_xors() {
        assert_eq!(checksum(&[]), 0xEF);
        assert_eq!(checksum(&[0xEF]), 0x00);
        assert_eq!(checksum(&[0x01, 0x02]), 0xEF ^ 0x01 ^ 0x02);
    }

    #[test]
    fn encode_wraps_header_and_payload_in_slip_frame() {
        let cmd = Command::read_reg(0x4000_1000);
        let encoded = cmd.encode();
        assert_eq!(encoded.first(), Some(&0xC0));
        assert_eq!(encoded.last(), Some(&0xC0));
        assert_eq!(encoded[1], 0x00);
        assert_eq!(encoded[2], Opcode::ReadReg as u8);
    }

    #[test]
    fn flash_data_checksum_excludes_header_and_includes_only_raw_block() {
        let cmd = Command::flash_data(&[1, 2, 3], 7);
        assert_eq!(cmd.checksum, checksum(&[1, 2, 3]) as u32);
    }

    #[test]
    fn flash_begin_timeout_scales_with_size_and_is_floored() {
        let small = Opcode::FlashBegin.timeout_for_size(0);
        assert_eq!(small, DEFAULT_TIMEOUT);
        let large = Opcode::FlashBegin.timeout_for_size(10_000_000);
        assert!(large > DEFAULT_TIMEOUT);
        assert!(large <= MAX_TIMEOUT);
    }
}
