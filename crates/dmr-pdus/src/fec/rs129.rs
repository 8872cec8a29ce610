//! Reed-Solomon(12,9) checksum over GF(2^8) protecting the full link
//! control of voice headers and terminators. Only generation and
//! verification are needed; bursts failing the check are discarded.

use std::sync::OnceLock;

/// GF(2^8) with primitive polynomial x^8 + x^4 + x^3 + x^2 + 1
const FIELD_POLY: u16 = 0x11D;

/// Generator coefficients of the (12,9) code
const GEN_COEFF: [u8; 3] = [64, 56, 14];

struct GfTables {
    exp: [u8; 512],
    log: [u8; 256],
}

fn tables() -> &'static GfTables {
    static TABLES: OnceLock<GfTables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u16 = 1;
        for i in 0..255 {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= FIELD_POLY;
            }
        }
        // doubled exp table spares a modulo in gmult
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        GfTables { exp, log }
    })
}

fn gmult(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = tables();
    t.exp[t.log[a as usize] as usize + t.log[b as usize] as usize]
}

/// Compute the three parity bytes over nine data bytes
pub fn encode(data: &[u8; 9]) -> [u8; 3] {
    let mut parity = [0u8; 3];
    for &byte in data.iter() {
        let dbyte = byte ^ parity[2];
        parity[2] = parity[1] ^ gmult(GEN_COEFF[0], dbyte);
        parity[1] = parity[0] ^ gmult(GEN_COEFF[1], dbyte);
        parity[0] = gmult(GEN_COEFF[2], dbyte);
    }
    // transmitted order: high coefficient first
    [parity[2], parity[1], parity[0]]
}

/// Verify a 12-byte codeword (9 data + 3 parity)
pub fn check(codeword: &[u8; 12]) -> bool {
    let mut data = [0u8; 9];
    data.copy_from_slice(&codeword[0..9]);
    encode(&data)[..] == codeword[9..12]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_check_round_trip() {
        let data: [u8; 9] = [0x00, 0x00, 0x20, 0x00, 0x0C, 0x1C, 0x04, 0xC2, 0x34];
        let parity = encode(&data);
        let mut cw = [0u8; 12];
        cw[0..9].copy_from_slice(&data);
        cw[9..12].copy_from_slice(&parity);
        assert!(check(&cw));
    }

    #[test]
    fn test_corruption_detected() {
        let data = [0x11u8, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99];
        let parity = encode(&data);
        let mut cw = [0u8; 12];
        cw[0..9].copy_from_slice(&data);
        cw[9..12].copy_from_slice(&parity);
        for i in 0..12 {
            let mut bad = cw;
            bad[i] ^= 0x01;
            assert!(!check(&bad), "corruption at byte {} not detected", i);
        }
    }

    #[test]
    fn test_gf_multiplication_basics() {
        assert_eq!(gmult(0, 0x57), 0);
        assert_eq!(gmult(1, 0x57), 0x57);
        // commutativity spot check
        assert_eq!(gmult(0x53, 0xCA), gmult(0xCA, 0x53));
    }
}
