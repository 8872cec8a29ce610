use dmr_core::{PduParseErr, Timeslot};

// ─── Packet types ─────────────────────────────────────────────────

pub const PKT_GROUP_VOICE: u8 = 0x80;
pub const PKT_PRIVATE_VOICE: u8 = 0x81;
pub const PKT_GROUP_DATA: u8 = 0x83;
pub const PKT_PRIVATE_DATA: u8 = 0x84;
pub const PKT_WAKE_UP: u8 = 0x85;
pub const PKT_MASTER_REGISTER: u8 = 0x90;
pub const PKT_REGISTER_REPLY: u8 = 0x91;
pub const PKT_PEER_LIST_REQ: u8 = 0x92;
pub const PKT_PEER_LIST_REPLY: u8 = 0x93;
pub const PKT_ALIVE_REQ: u8 = 0x96;
pub const PKT_ALIVE_REPLY: u8 = 0x97;

// ─── Burst types (byte 30 of a user packet) ──────────────────────

pub const BURST_VOICE_HEAD: u8 = 0x01;
pub const BURST_VOICE_TERM: u8 = 0x02;
pub const BURST_CSBK: u8 = 0x03;
pub const BURST_SLOT1_VOICE: u8 = 0x0A;
pub const BURST_SLOT2_VOICE: u8 = 0x8A;

// ─── Call-info flags (byte 17) ───────────────────────────────────

pub const CALL_INFO_TS2: u8 = 0x20;
pub const CALL_INFO_END: u8 = 0x40;

// ─── RTP ─────────────────────────────────────────────────────────

pub const RTP_PT_VOICE: u8 = 0x5D;
pub const RTP_PT_TERM: u8 = 0x5E;
/// RTP timestamp advance per 60 ms burst at 8 kHz
pub const RTP_TIMESTAMP_STEP: u32 = 480;

/// Fixed user-packet sizes: voice burst A, B/C/D/F, E, and the
/// header/terminator/data form
pub const SIZE_BURST_A: usize = 52;
pub const SIZE_BURST_BCDF: usize = 57;
pub const SIZE_BURST_E: usize = 66;
pub const SIZE_DATA: usize = 54;

/// Offset of the payload behind the fixed header
pub const USER_HEADER_LEN: usize = 31;

/// Wire size of the voice burst at `burst_index` within the 6-burst
/// superframe (A..F)
pub fn voice_burst_size(burst_index: u32) -> usize {
    match burst_index % 6 {
        0 => SIZE_BURST_A,
        4 => SIZE_BURST_E,
        _ => SIZE_BURST_BCDF,
    }
}

/// The 12-byte RTP-style header at bytes 18..30 of every user packet.
/// V=2, P=0, X=0, CC=0 always.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub seq: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn encode(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0] = 0x80;
        out[1] = ((self.marker as u8) << 7) | (self.payload_type & 0x7F);
        out[2..4].copy_from_slice(&self.seq.to_be_bytes());
        out[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        out[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, PduParseErr> {
        if data.len() < 12 {
            return Err(PduParseErr::BufferEnded { field: Some("rtp_header") });
        }
        if data[0] != 0x80 {
            return Err(PduParseErr::InvalidValue { field: "rtp_vpxcc", value: data[0] as u64 });
        }
        Ok(RtpHeader {
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7F,
            seq: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }
}

/// An IPSC voice/data user packet.
///
/// ```text
/// offset  size  field
/// 0       1     packet type
/// 1       4     peer id
/// 5       1     IPSC sequence
/// 6       3     src
/// 9       3     dst
/// 12      1     call type (0 = group, 1 = private)
/// 13      4     call control
/// 17      1     call info (0x20 = TS2, 0x40 = end)
/// 18      12    RTP-style header
/// 30      1     burst type
/// 31      ...   payload (size fixed per burst type)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpscUserPacket {
    pub packet_type: u8,
    pub peer_id: u32,
    pub seq: u8,
    pub src: u32,
    pub dst: u32,
    pub call_type: u8,
    pub call_control: u32,
    pub call_info: u8,
    pub rtp: RtpHeader,
    pub burst_type: u8,
    pub payload: Vec<u8>,
}

impl IpscUserPacket {
    pub fn is_group(&self) -> bool {
        matches!(self.packet_type, PKT_GROUP_VOICE | PKT_GROUP_DATA)
    }

    pub fn slot(&self) -> Timeslot {
        Timeslot::from_bit(self.call_info & CALL_INFO_TS2 != 0)
    }

    pub fn is_end(&self) -> bool {
        self.call_info & CALL_INFO_END != 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(USER_HEADER_LEN + self.payload.len());
        out.push(self.packet_type);
        out.extend_from_slice(&self.peer_id.to_be_bytes());
        out.push(self.seq);
        push_u24_be(&mut out, self.src);
        push_u24_be(&mut out, self.dst);
        out.push(self.call_type);
        out.extend_from_slice(&self.call_control.to_be_bytes());
        out.push(self.call_info);
        out.extend_from_slice(&self.rtp.encode());
        out.push(self.burst_type);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, PduParseErr> {
        if data.len() < USER_HEADER_LEN {
            return Err(PduParseErr::BufferEnded { field: Some("ipsc_user_header") });
        }
        match data[0] {
            PKT_GROUP_VOICE | PKT_PRIVATE_VOICE | PKT_GROUP_DATA | PKT_PRIVATE_DATA | PKT_WAKE_UP => {}
            other => {
                return Err(PduParseErr::InvalidValue { field: "ipsc_packet_type", value: other as u64 });
            }
        }
        Ok(IpscUserPacket {
            packet_type: data[0],
            peer_id: u32::from_be_bytes([data[1], data[2], data[3], data[4]]),
            seq: data[5],
            src: read_u24_be(data, 6),
            dst: read_u24_be(data, 9),
            call_type: data[12],
            call_control: u32::from_be_bytes([data[13], data[14], data[15], data[16]]),
            call_info: data[17],
            rtp: RtpHeader::parse(&data[18..30])?,
            burst_type: data[30],
            payload: data[31..].to_vec(),
        })
    }
}

/// Peer maintenance frames: type byte + big-endian peer id, the peer
/// list reply appending one id per registered peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpscControl {
    MasterRegister { peer_id: u32 },
    RegisterReply { peer_id: u32 },
    PeerListReq { peer_id: u32 },
    PeerListReply { peer_id: u32, peers: Vec<u32> },
    AliveReq { peer_id: u32 },
    AliveReply { peer_id: u32 },
}

impl IpscControl {
    pub fn encode(&self) -> Vec<u8> {
        let (ptype, peer_id) = match self {
            IpscControl::MasterRegister { peer_id } => (PKT_MASTER_REGISTER, *peer_id),
            IpscControl::RegisterReply { peer_id } => (PKT_REGISTER_REPLY, *peer_id),
            IpscControl::PeerListReq { peer_id } => (PKT_PEER_LIST_REQ, *peer_id),
            IpscControl::PeerListReply { peer_id, .. } => (PKT_PEER_LIST_REPLY, *peer_id),
            IpscControl::AliveReq { peer_id } => (PKT_ALIVE_REQ, *peer_id),
            IpscControl::AliveReply { peer_id } => (PKT_ALIVE_REPLY, *peer_id),
        };
        let mut out = vec![ptype];
        out.extend_from_slice(&peer_id.to_be_bytes());
        if let IpscControl::PeerListReply { peers, .. } = self {
            for peer in peers.iter() {
                out.extend_from_slice(&peer.to_be_bytes());
            }
        }
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, PduParseErr> {
        if data.len() < 5 {
            return Err(PduParseErr::BufferEnded { field: Some("ipsc_control") });
        }
        let peer_id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        match data[0] {
            PKT_MASTER_REGISTER => Ok(IpscControl::MasterRegister { peer_id }),
            PKT_REGISTER_REPLY => Ok(IpscControl::RegisterReply { peer_id }),
            PKT_PEER_LIST_REQ => Ok(IpscControl::PeerListReq { peer_id }),
            PKT_PEER_LIST_REPLY => {
                let mut peers = Vec::new();
                let mut offset = 5;
                while offset + 4 <= data.len() {
                    peers.push(u32::from_be_bytes([
                        data[offset],
                        data[offset + 1],
                        data[offset + 2],
                        data[offset + 3],
                    ]));
                    offset += 4;
                }
                Ok(IpscControl::PeerListReply { peer_id, peers })
            }
            PKT_ALIVE_REQ => Ok(IpscControl::AliveReq { peer_id }),
            PKT_ALIVE_REPLY => Ok(IpscControl::AliveReply { peer_id }),
            other => Err(PduParseErr::InvalidValue { field: "ipsc_packet_type", value: other as u64 }),
        }
    }
}

/// True when the leading type byte marks a peer maintenance frame
pub fn is_control_type(ptype: u8) -> bool {
    ptype >= PKT_MASTER_REGISTER
}

fn read_u24_be(data: &[u8], offset: usize) -> u32 {
    ((data[offset] as u32) << 16) | ((data[offset + 1] as u32) << 8) | (data[offset + 2] as u32)
}

fn push_u24_be(buf: &mut Vec<u8>, val: u32) {
    buf.push((val >> 16) as u8);
    buf.push((val >> 8) as u8);
    buf.push(val as u8);
}
