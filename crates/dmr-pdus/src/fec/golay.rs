//! Golay codes: the perfect (23,12,7) code, its extended (24,12,8) form
//! used by AMBE C0, and the shortened (20,8,7) form used by the slot type.

use std::sync::OnceLock;

use dmr_core::PduParseErr;

/// Generator polynomial x^11 + x^10 + x^6 + x^5 + x^4 + x^2 + 1
const GEN_POLY: u32 = 0xC75;

/// Remainder of `word` (degree < 23) divided by the generator polynomial
fn syndrome23(word: u32) -> u32 {
    let mut rem = word;
    for shift in (0..12).rev() {
        if rem & (1 << (shift + 11)) != 0 {
            rem ^= GEN_POLY << shift;
        }
    }
    rem & 0x7FF
}

/// Syndrome → error-pattern table. The (23,12) code is perfect: every
/// 11-bit syndrome corresponds to exactly one pattern of weight <= 3.
fn error_table() -> &'static [u32; 2048] {
    static TABLE: OnceLock<[u32; 2048]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u32; 2048];
        for a in 0..23 {
            let e = 1u32 << a;
            table[syndrome23(e) as usize] = e;
        }
        for a in 0..23 {
            for b in (a + 1)..23 {
                let e = (1u32 << a) | (1u32 << b);
                table[syndrome23(e) as usize] = e;
            }
        }
        for a in 0..23 {
            for b in (a + 1)..23 {
                for c in (b + 1)..23 {
                    let e = (1u32 << a) | (1u32 << b) | (1u32 << c);
                    table[syndrome23(e) as usize] = e;
                }
            }
        }
        table
    })
}

/// Systematic (23,12) encode: codeword = data·x^11 + remainder
pub fn encode_23_12(data: u16) -> u32 {
    debug_assert!(data < (1 << 12));
    let shifted = (data as u32) << 11;
    shifted | syndrome23(shifted)
}

/// Decode a 23-bit word, correcting up to 3 bit errors.
pub fn decode_23_12(word: u32) -> u16 {
    let syn = syndrome23(word & 0x7F_FFFF);
    let corrected = (word & 0x7F_FFFF) ^ error_table()[syn as usize];
    (corrected >> 11) as u16
}

/// Extended (24,12) encode: (23,12) codeword plus overall even parity
pub fn encode_24_12(data: u16) -> u32 {
    let cw = encode_23_12(data);
    (cw << 1) | (cw.count_ones() & 1)
}

/// Decode a 24-bit word. The parity bit is dropped before (23,12)
/// correction, matching the usual AMBE treatment.
pub fn decode_24_12(word: u32) -> u16 {
    decode_23_12((word >> 1) & 0x7F_FFFF)
}

/// Shortened (20,8) encode used for the DMR slot type: the 12-bit data
/// word has its four most significant bits fixed to zero and dropped
/// from the transmitted codeword.
pub fn encode_20_8(data: u8) -> u32 {
    encode_24_12(data as u16) & 0xF_FFFF
}

/// Decode a 20-bit slot-type codeword. Errors that decode to a word with
/// any of the four shortened bits set are uncorrectable.
pub fn decode_20_8(word: u32) -> Result<u8, PduParseErr> {
    let data = decode_24_12(word & 0xF_FFFF);
    if data >> 8 != 0 {
        return Err(PduParseErr::FecFailure { stage: "golay_20_8" });
    }
    Ok(data as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_23_12_clean_round_trip() {
        for data in [0u16, 1, 0x555, 0xABC, 0xFFF] {
            let cw = encode_23_12(data);
            assert_eq!(syndrome23(cw), 0, "codeword must have zero syndrome");
            assert_eq!(decode_23_12(cw), data);
        }
    }

    #[test]
    fn test_23_12_corrects_three_errors() {
        let cw = encode_23_12(0x9A5);
        for a in 0..23 {
            for b in (a + 1)..23 {
                for c in (b + 1)..23 {
                    let corrupted = cw ^ (1 << a) ^ (1 << b) ^ (1 << c);
                    assert_eq!(decode_23_12(corrupted), 0x9A5);
                }
            }
        }
    }

    #[test]
    fn test_24_12_round_trip_with_errors() {
        let cw = encode_24_12(0x3C7);
        assert_eq!(decode_24_12(cw), 0x3C7);
        // two errors beyond the parity bit
        assert_eq!(decode_24_12(cw ^ 0b1010_0000), 0x3C7);
    }

    #[test]
    fn test_20_8_round_trip() {
        for data in [0u8, 0x42, 0xFF] {
            let cw = encode_20_8(data);
            assert!(cw < (1 << 20));
            assert_eq!(decode_20_8(cw).unwrap(), data);
        }
    }

    #[test]
    fn test_20_8_single_error() {
        let cw = encode_20_8(0x5A);
        for flip in 0..20 {
            assert_eq!(decode_20_8(cw ^ (1 << flip)).unwrap(), 0x5A, "flip {}", flip);
        }
    }
}
