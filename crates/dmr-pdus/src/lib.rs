//! Wire formats for the BrewHub DMR network server
//!
//! Homebrew/MMDVM repeater protocol frames, DMRD burst packets, IPSC user
//! packets, and the DMR block codes (BPTC, Golay, Hamming, RS, AMBE FEC)
//! needed to translate between the two.

pub mod burst;
pub mod fec;
pub mod hbrp;
pub mod ipsc;
pub mod lc;
