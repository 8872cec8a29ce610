//! BPTC(196,96): the block product turbo code protecting the 96-bit
//! payload of DMR data bursts (voice headers, terminators, CSBKs).
//!
//! The 196 transmitted bits are an interleaved 13x15 grid (plus one pad
//! bit): nine rows of Hamming(15,11,3) whose first row starts with three
//! reserved bits, and fifteen columns of Hamming(13,9,3).

use dmr_core::{BitBuffer, PduParseErr};

use super::hamming;

pub const BPTC_BITS: usize = 196;
pub const PAYLOAD_BYTES: usize = 12;

/// Interleave index: transmitted bit i comes from grid position (i*181)%196
fn interleave_index(i: usize) -> usize {
    (i * 181) % BPTC_BITS
}

/// Grid position of row r, column c. Bit 0 of the de-interleaved block is
/// the pad bit; the grid proper starts at 1.
fn grid(r: usize, c: usize) -> usize {
    r * 15 + c + 1
}

/// Decode 196 transmitted bits (bit-per-byte) into the 12-byte payload.
/// Columns are corrected before rows; a second pass catches patterns the
/// first ordering misses. Remaining damage fails the block.
pub fn decode(transmitted: &[u8; BPTC_BITS]) -> Result<[u8; PAYLOAD_BYTES], PduParseErr> {
    let mut bits = [0u8; BPTC_BITS];
    for (i, &b) in transmitted.iter().enumerate() {
        bits[interleave_index(i)] = b & 1;
    }

    for _pass in 0..2 {
        for c in 0..15 {
            let mut col = [0u8; 13];
            for r in 0..13 {
                col[r] = bits[grid(r, c)];
            }
            if hamming::decode_1393(&mut col) {
                for r in 0..13 {
                    bits[grid(r, c)] = col[r];
                }
            }
        }
        for r in 0..9 {
            let row_start = grid(r, 0);
            let mut row = [0u8; 15];
            row.copy_from_slice(&bits[row_start..row_start + 15]);
            if hamming::decode_15113(&mut row) {
                bits[row_start..row_start + 15].copy_from_slice(&row);
            }
        }
    }

    // Verify the whole grid is now consistent
    for r in 0..9 {
        let row_start = grid(r, 0);
        let mut row = [0u8; 15];
        row.copy_from_slice(&bits[row_start..row_start + 15]);
        let mut check = row;
        hamming::encode_15113(&mut check);
        if check != row {
            return Err(PduParseErr::FecFailure { stage: "bptc_row" });
        }
    }
    for c in 0..15 {
        let mut col = [0u8; 13];
        for r in 0..13 {
            col[r] = bits[grid(r, c)];
        }
        let mut check = col;
        hamming::encode_1393(&mut check);
        if check != col {
            return Err(PduParseErr::FecFailure { stage: "bptc_column" });
        }
    }

    // Extract the 96 data bits: row 0 carries 8 (columns 3..11 after the
    // three reserved bits), rows 1..9 carry 11 each
    let mut buf = BitBuffer::new(96);
    for c in 3..11 {
        buf.write_bit(bits[grid(0, c)]);
    }
    for r in 1..9 {
        for c in 0..11 {
            buf.write_bit(bits[grid(r, c)]);
        }
    }
    let mut payload = [0u8; PAYLOAD_BYTES];
    payload.copy_from_slice(&buf.into_bytes());
    Ok(payload)
}

/// Encode a 12-byte payload into 196 transmitted bits (bit-per-byte)
pub fn encode(payload: &[u8; PAYLOAD_BYTES]) -> [u8; BPTC_BITS] {
    let mut bits = [0u8; BPTC_BITS];

    let mut buf = BitBuffer::from_bytes(payload);
    for c in 3..11 {
        bits[grid(0, c)] = buf.read_bit().expect("payload is 96 bits");
    }
    for r in 1..9 {
        for c in 0..11 {
            bits[grid(r, c)] = buf.read_bit().expect("payload is 96 bits");
        }
    }

    for r in 0..9 {
        let row_start = grid(r, 0);
        let mut row = [0u8; 15];
        row.copy_from_slice(&bits[row_start..row_start + 15]);
        hamming::encode_15113(&mut row);
        bits[row_start..row_start + 15].copy_from_slice(&row);
    }
    for c in 0..15 {
        let mut col = [0u8; 13];
        for r in 0..13 {
            col[r] = bits[grid(r, c)];
        }
        hamming::encode_1393(&mut col);
        for r in 0..13 {
            bits[grid(r, c)] = col[r];
        }
    }

    let mut transmitted = [0u8; BPTC_BITS];
    for (i, slot) in transmitted.iter_mut().enumerate() {
        *slot = bits[interleave_index(i)];
    }
    transmitted
}
