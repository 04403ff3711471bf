//! Chip family identification and eFuse-derived identity.

use crate::error::{Error, Result};

/// Magic value read back from [`MAGIC_REG_ADDR`], unique per chip family.
const ESP32_MAGIC: u32 = 0x00F0_1D83;
const ESP8266_MAGIC: u32 = 0xFFF0_C101;
const ESP32S2_MAGIC: u32 = 0x0000_07C6;

/// Register holding the chip-family magic value, readable both under the
/// ROM bootloader and under a loaded stub.
pub const MAGIC_REG_ADDR: u32 = 0x4000_1000;

/// One of the three chip families this driver speaks to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ChipFamily {
    Esp32,
    Esp32S2,
    Esp8266,
}

impl ChipFamily {
    /// Match a magic-register reading against the three known chip families.
    pub fn from_magic(magic: u32) -> Result<Self> {
        match magic {
            ESP32_MAGIC => Ok(ChipFamily::Esp32),
            ESP8266_MAGIC => Ok(ChipFamily::Esp8266),
            ESP32S2_MAGIC => Ok(ChipFamily::Esp32S2),
            other => Err(Error::UnknownChipFamily(other)),
        }
    }

    /// Base address of the four-word eFuse block this driver reads.
    pub fn efuse_base(&self) -> u32 {
        match self {
            ChipFamily::Esp8266 => 0x3FF0_0050,
            ChipFamily::Esp32 | ChipFamily::Esp32S2 => 0x6001_A000,
        }
    }
}

/// The four 32-bit eFuse words this driver reads, in ascending address order.
pub type Efuses = [u32; 4];

/// Derive the 6-byte station MAC address from the eFuse block.
pub fn mac_addr(family: ChipFamily, efuses: Efuses) -> Result<[u8; 6]> {
    match family {
        ChipFamily::Esp8266 => esp8266_mac(efuses),
        ChipFamily::Esp32 | ChipFamily::Esp32S2 => Ok(esp32_mac(efuses)),
    }
}

fn esp8266_mac(efuses: Efuses) -> Result<[u8; 6]> {
    let [e0, e1, _e2, e3] = efuses;

    let oui = if e3 != 0 {
        [
            ((e3 >> 16) & 0xFF) as u8,
            ((e3 >> 8) & 0xFF) as u8,
            (e3 & 0xFF) as u8,
        ]
    } else {
        match (e1 >> 16) & 0xFF {
            0 => [0x18, 0xFE, 0x34],
            1 => [0xAC, 0xD0, 0x74],
            _ => return Err(Error::UnknownOui),
        }
    };

    Ok([
        oui[0],
        oui[1],
        oui[2],
        ((e1 >> 8) & 0xFF) as u8,
        (e1 & 0xFF) as u8,
        ((e0 >> 24) & 0xFF) as u8,
    ])
}

fn esp32_mac(efuses: Efuses) -> [u8; 6] {
    let [_e0, e1, e2, _e3] = efuses;
    [
        ((e2 >> 8) & 0xFF) as u8,
        (e2 & 0xFF) as u8,
        ((e1 >> 24) & 0xFF) as u8,
        ((e1 >> 16) & 0xFF) as u8,
        ((e1 >> 8) & 0xFF) as u8,
        (e1 & 0xFF) as u8,
    ]
}

/// Human-readable chip name, distinguishing the ESP8266's two silicon
/// variants via the eFuse package-identification bits.
pub fn chip_name(family: ChipFamily, efuses: Efuses) -> &'static str {
    match family {
        ChipFamily::Esp32 => "ESP32",
        ChipFamily::Esp32S2 => "ESP32-S2",
        ChipFamily::Esp8266 => {
            let [e0, _e1, e2, _e3] = efuses;
            if (e0 & (1 << 4)) != 0 || (e2 & (1 << 16)) != 0 {
                "ESP8285"
            } else {
                "ESP8266EX"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn from_magic_matches_all_three_families() {
        assert_eq!(ChipFamily::from_magic(ESP32_MAGIC).unwrap(), ChipFamily::Esp32);
        assert_eq!(
            ChipFamily::from_magic(ESP8266_MAGIC).unwrap(),
            ChipFamily::Esp8266
        );
        assert_eq!(
            ChipFamily::from_magic(ESP32S2_MAGIC).unwrap(),
            ChipFamily::Esp32S2
        );
    }

    #[test]
    fn from_magic_rejects_unknown_value() {
        assert!(matches!(
            ChipFamily::from_magic(0xDEAD_BEEF),
            Err(Error::UnknownChipFamily(0xDEAD_BEEF))
        ));
    }

    #[test]
    fn esp32_mac_reads_from_efuse_1_and_2() {
        let efuses = [0, 0x1122_3344, 0xAABB_CCDD, 0];
        let mac = mac_addr(ChipFamily::Esp32, efuses).unwrap();
        assert_eq!(mac, [0xCC, 0xDD, 0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn esp8266_mac_prefers_efuse3_oui_when_present() {
        let efuses = [0xAA00_0000, 0x0000_1122, 0, 0x00AB_CDEF];
        let mac = mac_addr(ChipFamily::Esp8266, efuses).unwrap();
        assert_eq!(mac, [0xAB, 0xCD, 0xEF, 0x00, 0x22, 0xAA]);
    }

    #[test]
    fn esp8266_mac_falls_back_to_known_ouis() {
        let efuses_0 = [0, 0x0000_1100, 0, 0];
        assert_eq!(
            mac_addr(ChipFamily::Esp8266, efuses_0).unwrap()[0..3],
            [0x18, 0xFE, 0x34]
        );

        let efuses_1 = [0, 0x0001_1100, 0, 0];
        assert_eq!(
            mac_addr(ChipFamily::Esp8266, efuses_1).unwrap()[0..3],
            [0xAC, 0xD0, 0x74]
        );
    }

    #[test]
    fn esp8266_mac_rejects_unknown_oui_selector() {
        let efuses = [0, 0x0002_1100, 0, 0];
        assert!(matches!(
            mac_addr(ChipFamily::Esp8266, efuses),
            Err(Error::UnknownOui)
        ));
    }

    #[test]
    fn chip_name_distinguishes_esp8285_via_efuse_bits() {
        assert_eq!(chip_name(ChipFamily::Esp32, [0; 4]), "ESP32");
        assert_eq!(chip_name(ChipFamily::Esp8266, [0; 4]), "ESP8266EX");
        assert_eq!(
            chip_name(ChipFamily::Esp8266, [1 << 4, 0, 0, 0]),
            "ESP8285"
        );
        assert_eq!(
            chip_name(ChipFamily::Esp8266, [0, 0, 1 << 16, 0]),
            "ESP8285"
        );
    }
}
