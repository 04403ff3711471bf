//! Driver for the ESP8266/ESP32/ESP32-S2 ROM bootloader protocol.
//!
//! This crate speaks the serial wire protocol the ROM bootloader (and an
//! optional RAM-resident speed-up stub) understands: SLIP framing, the
//! command/response layer, chip-family detection, eFuse-derived identity,
//! and the flash/memory write state machines. It does not parse firmware
//! image formats, render progress, or drive a CLI — see [`Loader`] for the
//! operations this crate exposes and bring your own image format and UI.

mod buffer;
mod chip;
mod command;
mod error;
mod loader;
mod reader;
mod stub;
mod transport;

pub use chip::{ChipFamily, Efuses};
pub use error::{Error, Result};
pub use loader::{get_erase_size, Loader, LoaderOptions};
pub use stub::Stub;
pub use transport::Transport;

#[cfg(feature = "serial")]
pub use transport::SerialTransport;
