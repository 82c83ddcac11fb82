// src/checksums.rs
//
// CRC-32 used by the telemetry wire protocol for frame validation.

// ============================================================================
// Reflection Helpers
// ============================================================================

/// Reflect (reverse) the bits of a byte.
fn reflect8(mut value: u8) -> u8 {
    let mut result: u8 = 0;
    for _ in 0..8 {
        result = (result << 1) | (value & 1);
        value >>= 1;
    }
    result
}

/// Reflect (reverse) the bits of a 32-bit value.
fn reflect32(mut value: u32) -> u32 {
    let mut result: u32 = 0;
    for _ in 0..32 {
        result = (result << 1) | (value & 1);
        value >>= 1;
    }
    result
}

// ============================================================================
// Parameterised CRC Function (Canonical Implementation)
// ============================================================================

/// CRC-32 with arbitrary parameters.
///
/// # Arguments
/// * `data` - The data to calculate CRC over
/// * `polynomial` - The CRC polynomial (e.g., 0x04C11DB7 for standard CRC-32)
/// * `init` - Initial CRC value (e.g., 0x00000000 or 0xFFFFFFFF)
/// * `xor_out` - Final XOR value (e.g., 0x00000000 or 0xFFFFFFFF)
/// * `reflect_in` - Whether to reflect input bytes
/// * `reflect_out` - Whether to reflect the final CRC output
pub fn crc32_parameterised(
    data: &[u8],
    polynomial: u32,
    init: u32,
    xor_out: u32,
    reflect_in: bool,
    reflect_out: bool,
) -> u32 {
    let mut crc = init;

    if reflect_in {
        // Reflected input mode (LSB-first)
        let reflected_poly = reflect32(polynomial);
        for &byte in data {
            crc ^= byte as u32;
            for _ in 0..8 {
                if crc & 0x0000_0001 != 0 {
                    crc = (crc >> 1) ^ reflected_poly;
                } else {
                    crc >>= 1;
                }
            }
        }
    } else {
        // Normal input mode (MSB-first)
        for &byte in data {
            crc ^= (byte as u32) << 24;
            for _ in 0..8 {
                if crc & 0x8000_0000 != 0 {
                    crc = (crc << 1) ^ polynomial;
                } else {
                    crc <<= 1;
                }
            }
        }
    }

    let final_crc = if reflect_out != reflect_in {
        // Reflected input processing already produces reflected output;
        // reflect only when the two modes disagree.
        reflect32(crc)
    } else {
        crc
    };

    final_crc ^ xor_out
}

// ============================================================================
// Named Checksum Functions
// ============================================================================

/// Standard CRC-32 (ISO-HDLC): polynomial 0x04C11DB7, reflected, init and
/// xor-out 0xFFFFFFFF. This is the variant the telemetry firmware computes
/// over each frame body.
pub fn crc32_ieee_checksum(data: &[u8]) -> u32 {
    crc32_parameterised(data, 0x04C1_1DB7, 0xFFFF_FFFF, 0xFFFF_FFFF, true, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Reflection Tests
    // ========================================================================

    #[test]
    fn test_reflect8() {
        assert_eq!(reflect8(0x01), 0x80);
        assert_eq!(reflect8(0x80), 0x01);
        assert_eq!(reflect8(0xAA), 0x55);
        assert_eq!(reflect8(0xFF), 0xFF);
    }

    #[test]
    fn test_reflect32() {
        assert_eq!(reflect32(0x0000_0001), 0x8000_0000);
        assert_eq!(reflect32(0x04C1_1DB7), 0xEDB8_8320);
        assert_eq!(reflect32(0xFFFF_FFFF), 0xFFFF_FFFF);
    }

    // ========================================================================
    // CRC-32 Tests
    // ========================================================================

    #[test]
    fn test_crc32_ieee_test_vector() {
        // Known test vector from the CRC catalogue: "123456789" -> 0xCBF43926
        let data = b"123456789";
        assert_eq!(crc32_ieee_checksum(data), 0xCBF4_3926);
    }

    #[test]
    fn test_crc32_ieee_empty() {
        // Init 0xFFFFFFFF XOR xorout 0xFFFFFFFF = 0x00000000
        assert_eq!(crc32_ieee_checksum(&[]), 0x0000_0000);
    }

    #[test]
    fn test_crc32_ieee_frame_body() {
        // Body of a reading frame (length byte + 13-byte payload):
        // sensor id 1, sequence 1, value 36.6
        let body = [
            0x0D, // payload length
            0x01, // sensor id
            0x01, 0x00, 0x00, 0x00, // sequence (LE)
            0xCD, 0xCC, 0xCC, 0xCC, 0xCC, 0x4C, 0x42, 0x40, // 36.6 (f64 LE)
        ];
        assert_eq!(crc32_ieee_checksum(&body), 0x712B_A977);
    }

    #[test]
    fn test_crc32_single_byte() {
        // 0x00 -> 0xD202EF8D per the standard table
        assert_eq!(crc32_ieee_checksum(&[0x00]), 0xD202_EF8D);
    }

    #[test]
    fn test_crc32_parameterised_non_reflected() {
        // CRC-32/MPEG-2: same polynomial, no reflection, no xorout.
        // "123456789" -> 0x0376E6E7
        let data = b"123456789";
        assert_eq!(
            crc32_parameterised(data, 0x04C1_1DB7, 0xFFFF_FFFF, 0x0000_0000, false, false),
            0x0376_E6E7
        );
    }
}
