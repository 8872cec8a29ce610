//! Homebrew repeater protocol (MMDVM dialect) frame parsing and serialization

pub mod command;
pub mod dmrd;
pub mod rptc;

pub use command::*;
pub use dmrd::*;
pub use rptc::*;
