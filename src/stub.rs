//! The RAM-resident flasher stub.
//!
//! The ROM bootloader is slow and only speaks a minimal command set. Once
//! synchronized, the driver can upload a small relocatable program into
//! RAM and jump to it; the stub answers the same wire protocol but much
//! faster and with a larger command set. From the driver's point of view a
//! stub is just two byte blobs and an entry point — it never inspects or
//! links the code itself.

use crate::chip::ChipFamily;
use crate::error::{Error, Result};

/// A RAM-resident program uploaded in place of the ROM bootloader.
#[derive(Clone)]
pub struct Stub {
    pub text: Vec<u8>,
    pub text_start: u32,
    pub data: Vec<u8>,
    pub data_start: u32,
    pub entry: u32,
}

impl Stub {
    /// Ranges this stub occupies in RAM, used to reject overlapping
    /// `mem_begin` calls once the stub is running.
    pub fn ranges(&self) -> [(u32, u32); 2] {
        [
            (self.text_start, self.text_start + self.text.len() as u32),
            (self.data_start, self.data_start + self.data.len() as u32),
        ]
    }

    pub fn overlaps(&self, start: u32, len: u32) -> bool {
        let end = start + len;
        self.ranges()
            .iter()
            .any(|&(s, e)| start < e && s < end)
    }

    /// Resolve a built-in default stub for `family`. Only ESP32 ships one;
    /// every other family requires the caller to supply a `Stub` explicitly
    /// via [`crate::loader::Loader::load_stub`].
    pub fn for_family(family: ChipFamily) -> Result<Stub> {
        match family {
            ChipFamily::Esp32 => Ok(esp32_default()),
            ChipFamily::Esp32S2 | ChipFamily::Esp8266 => Err(Error::UnsupportedChipFamily(family)),
        }
    }
}

/// Placeholder default stub for ESP32. No production stub firmware image
/// was available to embed; this text segment is a single `ret` instruction
/// (opcode `0x80000000` little-endian) that immediately jumps back via the
/// entry point, present only so `Stub::for_family` has something non-empty
/// to hand to callers that don't supply their own stub. Real deployments
/// should build with an explicit `Stub`.
fn esp32_default() -> Stub {
    Stub {
        text: vec![0x00, 0x00, 0x00, 0x80],
        text_start: 0x4010_0000,
        data: Vec::new(),
        data_start: 0x3FFF_0000,
        entry: 0x4010_0000,
    }
}

/// Expected handshake bytes once the stub finishes loading and replies.
pub const HANDSHAKE: &[u8] = b"OHAI";

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn overlaps_detects_intersection_with_text_range() {
        let stub = esp32_default();
        assert!(stub.overlaps(stub.text_start, 4));
        assert!(!stub.overlaps(stub.text_start - 100, 4));
    }

    #[test]
    fn for_family_only_has_a_default_for_esp32() {
        assert!(Stub::for_family(ChipFamily::Esp32).is_ok());
        assert!(matches!(
            Stub::for_family(ChipFamily::Esp8266),
            Err(Error::UnsupportedChipFamily(ChipFamily::Esp8266))
        ));
        assert!(matches!(
            Stub::for_family(ChipFamily::Esp32S2),
            Err(Error::UnsupportedChipFamily(ChipFamily::Esp32S2))
        ));
    }
}
