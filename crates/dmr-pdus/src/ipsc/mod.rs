//! IPSC wire formats: user (voice/data) packets with their RTP-style
//! header, the peer maintenance frames, and the authenticated flavor.

pub mod auth;
pub mod packet;

pub use packet::*;
