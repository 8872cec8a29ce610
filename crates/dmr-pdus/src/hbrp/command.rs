//! Homebrew protocol command dispatch: token table, request parsing and
//! reply serialization. All integers are big-endian.

use dmr_core::PduParseErr;

use super::dmrd::DmrdPacket;
use super::rptc::RptcFrame;

// ─── Request tokens (repeater → server) ──────────────────────────

pub const CMD_DMRD: &[u8] = b"DMRD";
pub const CMD_DMRA: &[u8] = b"DMRA";
pub const CMD_RPTL: &[u8] = b"RPTL";
pub const CMD_RPTK: &[u8] = b"RPTK";
pub const CMD_RPTC: &[u8] = b"RPTC";
pub const CMD_RPTCL: &[u8] = b"RPTCL";
pub const CMD_RPTPING: &[u8] = b"RPTPING";
pub const CMD_RPTO: &[u8] = b"RPTO";

// ─── Reply tokens (server → repeater) ────────────────────────────

pub const REPLY_MSTNAK: &[u8] = b"MSTNAK";
pub const REPLY_MSTPONG: &[u8] = b"MSTPONG";
pub const REPLY_MSTCL: &[u8] = b"MSTCL";
pub const REPLY_RPTACK: &[u8] = b"RPTACK";
pub const REPLY_RPTSBKN: &[u8] = b"RPTSBKN";

/// Fixed request lengths (bytes), token included
pub const RPTL_LEN: usize = 8;
pub const RPTK_LEN: usize = 40;
pub const RPTC_LEN: usize = 302;
pub const RPTCL_LEN: usize = 9;
pub const RPTPING_LEN: usize = 11;
pub const DMRA_LEN: usize = 15;

/// A parsed request datagram from a repeater
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Voice/data burst
    Dmrd(DmrdPacket),
    /// Talker alias block: logged, not routed
    TalkerAlias { repeater_id: u32, alias: [u8; 7] },
    /// Login request opening the handshake
    Login { repeater_id: u32 },
    /// Challenge response carrying SHA-256(salt || password)
    Key { repeater_id: u32, hash: [u8; 32] },
    /// 302-byte configuration frame completing the handshake
    Config { repeater_id: u32, frame: RptcFrame },
    /// Logout
    Closing { repeater_id: u32 },
    /// Keep-alive
    Ping { repeater_id: u32 },
    /// Options frame: logged, not interpreted
    Options { repeater_id: u32, options: String },
}

impl Command {
    /// Dispatch a raw datagram by its leading ASCII token.
    /// Longer tokens are matched first (RPTCL shares the RPTC prefix).
    pub fn parse(data: &[u8]) -> Result<Command, PduParseErr> {
        if data.starts_with(CMD_DMRD) {
            return Ok(Command::Dmrd(DmrdPacket::parse(data)?));
        }
        if data.starts_with(CMD_DMRA) {
            expect_len(data, DMRA_LEN)?;
            let mut alias = [0u8; 7];
            alias.copy_from_slice(&data[8..15]);
            return Ok(Command::TalkerAlias { repeater_id: read_id(data, 4)?, alias });
        }
        if data.starts_with(CMD_RPTPING) {
            expect_len(data, RPTPING_LEN)?;
            return Ok(Command::Ping { repeater_id: read_id(data, 7)? });
        }
        if data.starts_with(CMD_RPTCL) {
            expect_len(data, RPTCL_LEN)?;
            return Ok(Command::Closing { repeater_id: read_id(data, 5)? });
        }
        if data.starts_with(CMD_RPTC) {
            expect_len(data, RPTC_LEN)?;
            let repeater_id = read_id(data, 4)?;
            let frame = RptcFrame::parse(&data[8..])?;
            return Ok(Command::Config { repeater_id, frame });
        }
        if data.starts_with(CMD_RPTL) {
            expect_len(data, RPTL_LEN)?;
            return Ok(Command::Login { repeater_id: read_id(data, 4)? });
        }
        if data.starts_with(CMD_RPTK) {
            expect_len(data, RPTK_LEN)?;
            let repeater_id = read_id(data, 4)?;
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&data[8..40]);
            return Ok(Command::Key { repeater_id, hash });
        }
        if data.starts_with(CMD_RPTO) {
            let repeater_id = read_id(data, 4)?;
            let options = String::from_utf8_lossy(&data[8..]).into_owned();
            return Ok(Command::Options { repeater_id, options });
        }
        Err(PduParseErr::UnknownCommand)
    }
}

// ─── Reply builders ──────────────────────────────────────────────

/// `MSTNAK || id`
pub fn build_mstnak(repeater_id: u32) -> Vec<u8> {
    build_with_id(REPLY_MSTNAK, repeater_id)
}

/// `MSTPONG || id`
pub fn build_mstpong(repeater_id: u32) -> Vec<u8> {
    build_with_id(REPLY_MSTPONG, repeater_id)
}

/// `MSTCL || id`, sent during shutdown
pub fn build_mstcl(repeater_id: u32) -> Vec<u8> {
    build_with_id(REPLY_MSTCL, repeater_id)
}

/// `RPTACK || id`, acknowledging key/config frames
pub fn build_rptack_id(repeater_id: u32) -> Vec<u8> {
    build_with_id(REPLY_RPTACK, repeater_id)
}

/// `RPTACK || salt`, the login challenge. The salt's big-endian
/// representation is left-zero-padded to exactly 4 bytes.
pub fn build_rptack_salt(salt: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(REPLY_RPTACK.len() + 4);
    buf.extend_from_slice(REPLY_RPTACK);
    buf.extend_from_slice(&salt.to_be_bytes());
    buf
}

/// `RPTSBKN || id`, scheduled shortly after a successful key exchange
pub fn build_rptsbkn(repeater_id: u32) -> Vec<u8> {
    build_with_id(REPLY_RPTSBKN, repeater_id)
}

fn build_with_id(token: &[u8], repeater_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(token.len() + 4);
    buf.extend_from_slice(token);
    buf.extend_from_slice(&repeater_id.to_be_bytes());
    buf
}

fn expect_len(data: &[u8], expected: usize) -> Result<(), PduParseErr> {
    if data.len() != expected {
        return Err(PduParseErr::InconsistentLength { expected, found: data.len() });
    }
    Ok(())
}

fn read_id(data: &[u8], offset: usize) -> Result<u32, PduParseErr> {
    if data.len() < offset + 4 {
        return Err(PduParseErr::BufferEnded { field: Some("repeater_id") });
    }
    Ok(u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]))
}
