//! Error types returned by this crate.

use std::io;
use thiserror::Error;

use crate::chip::ChipFamily;

/// All possible errors returned while driving the ROM bootloader protocol.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("IO error while using the serial transport: {0}")]
    Io(#[from] io::Error),

    #[error("timed out waiting for a response")]
    Timeout,

    #[error("failed to synchronize with the ROM bootloader after all retries")]
    ConnectError,

    #[error("magic value 0x{0:08x} did not match any known chip family")]
    UnknownChipFamily(u32),

    #[error("response echoed opcode 0x{actual:02x}, expected 0x{expected:02x}")]
    InvalidOpcodeResponse { expected: u8, actual: u8 },

    #[error("stub did not reply with the expected handshake")]
    StubStartFailed,

    #[error("no built-in flash stub is available for {0:?}")]
    UnsupportedChipFamily(ChipFamily),

    #[error("could not determine OUI from eFuses")]
    UnknownOui,

    #[error("memory range overlaps the currently loaded stub")]
    StubOverlap,

    #[error("big-endian packing is not supported")]
    UnsupportedEndianness,

    #[error("argument count did not match the pack format string")]
    PackArgMismatch,

    #[error("the reader is already running")]
    AlreadyRunning,

    #[error("the reader is not running")]
    NotRunning,

    #[error("operation requires an active listener on the reader")]
    NotListening,

    #[error("another read is already in progress on this reader")]
    ReadAlreadyInProgress,

    #[error("ROM bootloader reported error byte 0x{0:02x} for command 0x{1:02x}")]
    RomError(u8, u8),
}

pub type Result<T> = std::result::Result<T, Error>;
