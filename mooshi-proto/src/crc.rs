//! Table-driven CRC-32
//!
//! The meter checksums every frame (and the compressed tree description)
//! with the reflected CRC-32 used by zlib. The engine is parameterised so
//! the same table builder also covers the non-reflected BZIP2 variant.

/// Generator polynomial in normal (MSB-first) notation
pub const CRC32_POLYNOMIAL: u32 = 0x04C1_1DB7;
pub const CRC32_INITIAL_REMAINDER: u32 = 0xFFFF_FFFF;
pub const CRC32_FINAL_XOR_VALUE: u32 = 0xFFFF_FFFF;

/// Checksum of the ASCII string `"123456789"` under the meter's parameters
pub const CRC32_CHECK_VALUE: u32 = 0xCBF4_3926;

/// Parameters of a 32-bit CRC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcParams {
    pub polynomial: u32,
    pub initial: u32,
    pub final_xor: u32,
    /// Process bits LSB-first and emit a reflected remainder
    pub reflect: bool,
}

impl CrcParams {
    /// The meter's CRC (CRC-32/ISO-HDLC)
    pub const METER: CrcParams = CrcParams {
        polynomial: CRC32_POLYNOMIAL,
        initial: CRC32_INITIAL_REMAINDER,
        final_xor: CRC32_FINAL_XOR_VALUE,
        reflect: true,
    };

    /// CRC-32/BZIP2: same constants, MSB-first
    pub const BZIP2: CrcParams = CrcParams {
        polynomial: CRC32_POLYNOMIAL,
        initial: CRC32_INITIAL_REMAINDER,
        final_xor: CRC32_FINAL_XOR_VALUE,
        reflect: false,
    };
}

/// A CRC engine with its 256-entry lookup table built once
#[derive(Clone)]
pub struct Crc32 {
    params: CrcParams,
    table: [u32; 256],
}

impl Crc32 {
    pub fn new() -> Self {
        Self::with_params(CrcParams::METER)
    }

    pub fn with_params(params: CrcParams) -> Self {
        let mut table = [0u32; 256];

        if params.reflect {
            let poly = params.polynomial.reverse_bits();
            for (i, slot) in table.iter_mut().enumerate() {
                let mut crc = i as u32;
                for _ in 0..8 {
                    crc = if crc & 1 != 0 { (crc >> 1) ^ poly } else { crc >> 1 };
                }
                *slot = crc;
            }
        } else {
            for (i, slot) in table.iter_mut().enumerate() {
                let mut crc = (i as u32) << 24;
                for _ in 0..8 {
                    crc = if crc & 0x8000_0000 != 0 {
                        (crc << 1) ^ params.polynomial
                    } else {
                        crc << 1
                    };
                }
                *slot = crc;
            }
        }

        Self { params, table }
    }

    pub fn params(&self) -> CrcParams {
        self.params
    }

    /// Checksum of `data`
    pub fn calculate(&self, data: &[u8]) -> u32 {
        let mut crc = self.params.initial;

        if self.params.reflect {
            for &byte in data {
                crc = (crc >> 8) ^ self.table[((crc ^ byte as u32) & 0xFF) as usize];
            }
        } else {
            for &byte in data {
                crc = (crc << 8) ^ self.table[(((crc >> 24) ^ byte as u32) & 0xFF) as usize];
            }
        }

        crc ^ self.params.final_xor
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Crc32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crc32").field("params", &self.params).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_value() {
        assert_eq!(Crc32::new().calculate(b"123456789"), CRC32_CHECK_VALUE);
    }

    #[test]
    fn bzip2_check_value() {
        let crc = Crc32::with_params(CrcParams::BZIP2);
        assert_eq!(crc.calculate(b"123456789"), 0xFC89_1918);
    }

    #[test]
    fn empty_input() {
        // initial remainder xor final value
        assert_eq!(Crc32::new().calculate(&[]), 0);
    }

    #[test]
    fn single_bit_flip_changes_checksum() {
        let crc = Crc32::new();
        let a = crc.calculate(&[0x01, 0x02, 0x03, 0x04]);
        let b = crc.calculate(&[0x01, 0x02, 0x03, 0x05]);
        assert_ne!(a, b);
    }
}
