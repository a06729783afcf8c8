//! Seed/key login for SecurityAccess.
//!
//! The ECU answers a seed request with a four byte seed. The key is the seed
//! shifted left a few times, XORing in a constant from a table whenever the
//! top bit falls off.

use serde::{Deserialize, Serialize};

pub const DEFAULT_REQUEST_SEED: u8 = 0x01;
/// 0x77 to 0x7F all work
pub const INTERNAL_ROM_REQUEST_SEED: u8 = 0x77;
pub const EXTERNAL_RAM_REQUEST_SEED: u8 = 0x7F;
/// Login with `seed + 0x11223344`
pub const SPECIAL_REQUEST_SEED: u8 = 0x03;

const SPECIAL_KEY_OFFSET: u32 = 0x11223344;
const DEFAULT_LOOPS: u8 = 5;
/// Works for 2000 to 2003 VW/Audi ECUs
pub const DEFAULT_KEY_INDEX: usize = 0x3F;
/// Positive SendKey response carries this status
pub const KEY_ACCEPTED: u8 = 0x34;

const EXTENDED_SEED_REQUEST_TEXT: &[u8] = b"SECURITY";

#[rustfmt::skip]
const KEY_TABLE: [u32; 64] = [
    0x0A221289, 0x144890A1, 0x24212491, 0x290A0285, 0x42145091, 0x504822C1, 0x0A24C4C1, 0x14252229,
    0x24250525, 0x2510A491, 0x28488863, 0x29148885, 0x422184A5, 0x49128521, 0x50844A85, 0x620CC211,
    0x124452A9, 0x18932251, 0x2424A459, 0x29149521, 0x42352621, 0x4A512289, 0x52A48911, 0x11891475,
    0x22346523, 0x4A3118D1, 0x64497111, 0x0AE34529, 0x15398989, 0x22324A67, 0x2D12B489, 0x132A4A75,
    0x19B13469, 0x25D2C453, 0x4949349B, 0x524E9259, 0x1964CA6B, 0x24F5249B, 0x28979175, 0x352A5959,
    0x3A391749, 0x51D44EA9, 0x564A4F25, 0x6AD52649, 0x76493925, 0x25DE52C9, 0x332E9333, 0x68D64997,
    0x494947FB, 0x33749ACF, 0x5AD55B5D, 0x7F272A4F, 0x35BD5B75, 0x3F5AD55D, 0x5B5B6DAD, 0x6B5DAD6B,
    0x75B57AD5, 0x5DBAD56F, 0x6DBF6AAD, 0x75775EB5, 0x5AEDFED5, 0x6B5F7DD5, 0x6F757B6B, 0x5FBD5DBD,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    /// Access mode used to request the seed, forced odd
    pub request_seed: u8,
    pub support_special_key: bool,
    pub extended_seed_request: bool,
    pub key_index: usize,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            request_seed: DEFAULT_REQUEST_SEED,
            support_special_key: false,
            extended_seed_request: false,
            key_index: DEFAULT_KEY_INDEX,
        }
    }
}

impl SecuritySettings {
    pub fn request_seed_mode(&self) -> u8 {
        self.request_seed | 0x01
    }

    pub fn send_key_mode(&self) -> u8 {
        self.request_seed_mode().wrapping_add(1)
    }

    /// Data for the seed request, the access mode included.
    pub fn seed_request(&self) -> Vec<u8> {
        let mut data = vec![self.request_seed_mode()];
        if self.extended_seed_request {
            data.push(DEFAULT_LOOPS);
            data.extend_from_slice(EXTENDED_SEED_REQUEST_TEXT);
            data.push(0);
        }
        data
    }

    /// Computes the key for a four byte seed.
    ///
    /// Returns `None` for a seed of the wrong length.
    pub fn key_from_seed(&self, seed: &[u8]) -> Option<u32> {
        let seed = u32::from_be_bytes(seed.try_into().ok()?);

        if self.support_special_key && self.request_seed_mode() == SPECIAL_REQUEST_SEED {
            return Some(seed.wrapping_add(SPECIAL_KEY_OFFSET));
        }

        let constant = KEY_TABLE[self.key_index.min(KEY_TABLE.len() - 1)];
        let mut key = seed;
        for _ in 0..DEFAULT_LOOPS {
            key = if key & 0x8000_0000 != 0 {
                ((key << 1) | 1) ^ constant
            } else {
                key << 1
            };
        }
        Some(key)
    }

    /// Data for the send key request, the access mode included.
    pub fn key_request(&self, seed: &[u8]) -> Option<Vec<u8>> {
        let key = self.key_from_seed(seed)?;
        let mut data = vec![self.send_key_mode()];
        data.extend_from_slice(&key.to_be_bytes());
        Some(data)
    }
}

/// An all zero seed means the ECU is already unlocked
pub fn is_unlocked_seed(seed: &[u8]) -> bool {
    seed.iter().all(|b| *b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn reference_key(seed: u32) -> u32 {
        let mut key = seed as u64;
        for _ in 0..5 {
            if key >= 0x80000000 {
                key = ((key << 1) | 1) ^ 0x5FBD5DBD;
            } else {
                key <<= 1;
            }
            key &= 0xFFFF_FFFF;
        }
        key as u32
    }

    #[test]
    fn key_matches_shift_and_xor() {
        let settings = SecuritySettings::default();
        for seed in [0x00000001u32, 0x12345678, 0x80000000, 0xFFFFFFFF, 0xDEADBEEF] {
            assert_eq!(
                settings.key_from_seed(&seed.to_be_bytes()),
                Some(reference_key(seed)),
                "seed {seed:#010x}"
            );
        }
    }

    #[test]
    fn small_seed_is_only_shifted() {
        let settings = SecuritySettings::default();
        assert_eq!(settings.key_from_seed(&[0x00, 0x00, 0x00, 0x01]), Some(0x20));
        assert_eq!(
            settings.key_request(&[0x00, 0x00, 0x00, 0x01]),
            Some(vec![0x02, 0x00, 0x00, 0x00, 0x20])
        );
    }

    #[test]
    fn special_key_adds_offset() {
        let settings = SecuritySettings {
            request_seed: SPECIAL_REQUEST_SEED,
            support_special_key: true,
            ..SecuritySettings::default()
        };
        assert_eq!(
            settings.key_from_seed(&[0xFF, 0xFF, 0xFF, 0xFF]),
            Some(0x11223343)
        );
        assert_eq!(settings.send_key_mode(), 0x04);
    }

    #[test]
    fn even_seed_mode_is_made_odd() {
        let settings = SecuritySettings {
            request_seed: 0x76,
            ..SecuritySettings::default()
        };
        assert_eq!(settings.request_seed_mode(), INTERNAL_ROM_REQUEST_SEED);
        assert_eq!(settings.send_key_mode(), 0x78);
    }

    #[test]
    fn extended_seed_request_data() {
        let settings = SecuritySettings {
            extended_seed_request: true,
            ..SecuritySettings::default()
        };
        assert_eq!(
            settings.seed_request(),
            vec![0x01, 0x05, b'S', b'E', b'C', b'U', b'R', b'I', b'T', b'Y', 0x00]
        );
        assert_eq!(SecuritySettings::default().seed_request(), vec![0x01]);
    }

    #[test]
    fn wrong_seed_length() {
        assert_eq!(SecuritySettings::default().key_from_seed(&[1, 2, 3]), None);
        assert!(is_unlocked_seed(&[0, 0, 0, 0]));
        assert!(!is_unlocked_seed(&[0, 0, 1, 0]));
    }
}
