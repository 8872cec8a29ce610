use core::fmt;

use dmr_core::{PduParseErr, Timeslot};

/// Leading magic of a voice/data burst datagram
pub const DMRD_MAGIC: &[u8; 4] = b"DMRD";

/// Fixed datagram length without the trailing BER/RSSI pair
pub const DMRD_LEN: usize = 53;
/// Datagram length including the trailing BER/RSSI pair
pub const DMRD_LEN_BER: usize = 55;

// ─── dtypeOrVSeq values inside DATA_SYNC frames ──────────────────

pub const DTYPE_VOICE_HEAD: u8 = 1;
pub const DTYPE_VOICE_TERM: u8 = 2;
pub const DTYPE_CSBK: u8 = 3;

/// The 2-bit frame type at offset 15
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Voice,
    VoiceSync,
    DataSync,
}

impl FrameType {
    pub fn from_bits(v: u8) -> Result<Self, PduParseErr> {
        match v {
            0 => Ok(FrameType::Voice),
            1 => Ok(FrameType::VoiceSync),
            2 => Ok(FrameType::DataSync),
            other => Err(PduParseErr::InvalidValue {
                field: "frame_type",
                value: other as u64,
            }),
        }
    }

    pub fn as_bits(&self) -> u8 {
        match self {
            FrameType::Voice => 0,
            FrameType::VoiceSync => 1,
            FrameType::DataSync => 2,
        }
    }
}

/// A decoded DMRD voice/data burst.
///
/// Wire layout (53 bytes, 55-byte form adds two trailing BER/RSSI bytes):
/// ```text
/// offset  size  field
/// 0       4     "DMRD"
/// 4       1     seq
/// 5       3     src (24-bit big-endian)
/// 8       3     dst
/// 11      4     repeater id
/// 15      1     bits: slot(1) | group_call(1) | frame_type(2) | dtype_vseq(4)
/// 16      4     stream id
/// 20      33    DMR burst payload
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmrdPacket {
    pub seq: u8,
    pub src: u32,
    pub dst: u32,
    pub repeater: u32,
    pub slot: Timeslot,
    pub group_call: bool,
    pub frame_type: FrameType,
    /// DATA_SYNC: the data type; VOICE: the voice sequence number (A=0..F=5)
    pub dtype_vseq: u8,
    pub stream_id: u32,
    pub payload: [u8; 33],
    /// Bit error rate byte from the 55-byte form; -1 when absent
    pub ber: i16,
    /// Signal strength byte from the 55-byte form; -1 when absent
    pub rssi: i16,
}

impl DmrdPacket {
    pub fn parse(data: &[u8]) -> Result<Self, PduParseErr> {
        if data.len() != DMRD_LEN && data.len() != DMRD_LEN_BER {
            return Err(PduParseErr::InconsistentLength {
                expected: DMRD_LEN,
                found: data.len(),
            });
        }
        if &data[0..4] != DMRD_MAGIC {
            return Err(PduParseErr::InvalidValue {
                field: "magic",
                value: u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64,
            });
        }

        let bits = data[15];
        let frame_type = FrameType::from_bits((bits >> 4) & 0x3)?;

        let mut payload = [0u8; 33];
        payload.copy_from_slice(&data[20..53]);

        let (ber, rssi) = if data.len() == DMRD_LEN_BER {
            (data[53] as i16, data[54] as i16)
        } else {
            (-1, -1)
        };

        Ok(DmrdPacket {
            seq: data[4],
            src: read_u24_be(data, 5),
            dst: read_u24_be(data, 8),
            repeater: u32::from_be_bytes([data[11], data[12], data[13], data[14]]),
            slot: Timeslot::from_bit(bits & 0x80 != 0),
            group_call: bits & 0x40 != 0,
            frame_type,
            dtype_vseq: bits & 0x0F,
            stream_id: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
            payload,
            ber,
            rssi,
        })
    }

    /// Serialize. The BER/RSSI pair is appended only when both are known.
    pub fn encode(&self) -> Vec<u8> {
        let with_ber = self.ber >= 0 && self.rssi >= 0;
        let mut buf = Vec::with_capacity(if with_ber { DMRD_LEN_BER } else { DMRD_LEN });
        buf.extend_from_slice(DMRD_MAGIC);
        buf.push(self.seq);
        write_u24_be(&mut buf, self.src);
        write_u24_be(&mut buf, self.dst);
        buf.extend_from_slice(&self.repeater.to_be_bytes());

        let mut bits = (self.frame_type.as_bits() << 4) | (self.dtype_vseq & 0x0F);
        if self.slot.as_bit() {
            bits |= 0x80;
        }
        if self.group_call {
            bits |= 0x40;
        }
        buf.push(bits);

        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        if with_ber {
            buf.push(self.ber as u8);
            buf.push(self.rssi as u8);
        }
        buf
    }

    /// True for any burst belonging to a voice stream, including the
    /// DATA_SYNC voice header and terminator that bracket it.
    pub fn is_voice(&self) -> bool {
        match self.frame_type {
            FrameType::Voice | FrameType::VoiceSync => true,
            FrameType::DataSync => {
                self.dtype_vseq == DTYPE_VOICE_HEAD || self.dtype_vseq == DTYPE_VOICE_TERM
            }
        }
    }

    pub fn is_voice_head(&self) -> bool {
        self.frame_type == FrameType::DataSync && self.dtype_vseq == DTYPE_VOICE_HEAD
    }

    pub fn is_voice_term(&self) -> bool {
        self.frame_type == FrameType::DataSync && self.dtype_vseq == DTYPE_VOICE_TERM
    }
}

impl fmt::Display for DmrdPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DMRD seq={} {} {}->{} rpt={} {:?}/{} stream={:08x}",
            self.seq,
            self.slot,
            self.src,
            self.dst,
            self.repeater,
            self.frame_type,
            self.dtype_vseq,
            self.stream_id
        )
    }
}

fn read_u24_be(data: &[u8], offset: usize) -> u32 {
    ((data[offset] as u32) << 16) | ((data[offset + 1] as u32) << 8) | (data[offset + 2] as u32)
}

fn write_u24_be(buf: &mut Vec<u8>, val: u32) {
    buf.push((val >> 16) as u8);
    buf.push((val >> 8) as u8);
    buf.push(val as u8);
}
