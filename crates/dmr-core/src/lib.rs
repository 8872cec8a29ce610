//! Core utilities for the BrewHub DMR network server
//!
//! This crate provides fundamental types and utilities used across the stack

/// Git version string, set at compile time
pub const GIT_VERSION: &str = git_version::git_version!(fallback = "unknown");
/// Server version followed by git version string, e.g., "0.3.4-aabbccdd"
pub const SERVER_VERSION: &str = const_format::formatcp!("{}-{}", env!("CARGO_PKG_VERSION"), GIT_VERSION);

pub mod address;
pub mod bitbuffer;
pub mod debug;
pub mod pdu_parse_error;

// Re-export commonly used items
pub use address::*;
pub use bitbuffer::BitBuffer;
pub use pdu_parse_error::PduParseErr;

/// Numeric id of a repeater, as registered in the network database
pub type RepeaterId = u32;

/// 32-bit identifier stable for one keyed transmission
pub type StreamId = u32;

/// The two DMR TDMA timeslots, carried as a single bit on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeslot {
    Ts1,
    Ts2,
}

impl Timeslot {
    /// Decode from the wire bit (0 = TS1, 1 = TS2)
    pub fn from_bit(bit: bool) -> Self {
        if bit { Timeslot::Ts2 } else { Timeslot::Ts1 }
    }

    pub fn as_bit(&self) -> bool {
        matches!(self, Timeslot::Ts2)
    }
}

impl core::fmt::Display for Timeslot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Timeslot::Ts1 => write!(f, "TS1"),
            Timeslot::Ts2 => write!(f, "TS2"),
        }
    }
}
