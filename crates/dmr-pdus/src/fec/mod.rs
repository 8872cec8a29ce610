//! Block codes used by DMR bursts: Hamming row/column codes and the
//! BPTC(196,96) product code for data payloads, Golay codes for slot type
//! and AMBE voice, RS(12,9) for full link control.

pub mod ambe;
pub mod bptc19696;
pub mod golay;
pub mod hamming;
pub mod rs129;
