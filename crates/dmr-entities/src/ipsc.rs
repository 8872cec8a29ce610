//! IPSC ingress: peer maintenance, the authenticated flavor, and the
//! bidirectional burst translator between MMDVM DMRD packets and IPSC
//! user packets.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, unbounded};

use dmr_config::CfgIpsc;
use dmr_core::{StreamId, Timeslot};
use dmr_pdus::burst::{self, SlotType};
use dmr_pdus::fec::{ambe, bptc19696};
use dmr_pdus::hbrp::{DTYPE_VOICE_HEAD, DTYPE_VOICE_TERM, DmrdPacket, FrameType};
use dmr_pdus::ipsc::{self, IpscControl, IpscUserPacket, RtpHeader, auth};
use dmr_pdus::lc::FullLinkControl;

use crate::router::Router;

/// Payload length of the header/terminator/data form
const DATA_PAYLOAD_LEN: usize = ipsc::SIZE_DATA - ipsc::USER_HEADER_LEN;

// ─── Translator state ─────────────────────────────────────────────

struct ForwardStream {
    call_control: u32,
    rtp_seq: u16,
    rtp_timestamp: u32,
    ipsc_seq: u8,
    burst_index: u32,
    first_packet: bool,
    flc: Option<FullLinkControl>,
    last_activity: Instant,
}

struct ReverseStream {
    stream_id: StreamId,
    burst_index: u32,
    seq: u8,
    header_seen: bool,
    last_activity: Instant,
}

/// Stateful converter between the two voice framings. Forward streams
/// are keyed by DMRD stream id, reverse streams by IPSC call control.
pub struct IpscTranslator {
    peer_id: u32,
    max_age: Duration,
    forward: HashMap<StreamId, ForwardStream>,
    reverse: HashMap<u32, ReverseStream>,
}

impl IpscTranslator {
    pub fn new(peer_id: u32, max_age: Duration) -> Self {
        Self {
            peer_id,
            max_age,
            forward: HashMap::new(),
            reverse: HashMap::new(),
        }
    }

    /// Translate one DMRD burst into zero or more IPSC user packets
    /// (a voice header fans out as three).
    pub fn forward(&mut self, packet: &DmrdPacket) -> Vec<IpscUserPacket> {
        let peer_id = self.peer_id;
        let stream = self.forward.entry(packet.stream_id).or_insert_with(|| {
            tracing::debug!("IpscTranslator: new forward stream {:08x}", packet.stream_id);
            ForwardStream {
                call_control: rand::random(),
                rtp_seq: 0,
                rtp_timestamp: 0,
                ipsc_seq: 0,
                burst_index: 0,
                first_packet: true,
                flc: None,
                last_activity: Instant::now(),
            }
        });
        stream.last_activity = Instant::now();

        let flc = *stream
            .flc
            .get_or_insert_with(|| FullLinkControl::for_call(packet.group_call, packet.src, packet.dst));

        let mut out = Vec::new();
        match packet.frame_type {
            FrameType::DataSync if packet.is_voice_head() => {
                // IPSC sends the voice header three times
                let Ok(lc_block) = flc.encode_with_rs(DTYPE_VOICE_HEAD) else {
                    return out;
                };
                for _ in 0..3 {
                    let marker = stream.first_packet;
                    stream.first_packet = false;
                    let mut user = base_user(peer_id, packet, stream, marker, ipsc::RTP_PT_VOICE);
                    user.burst_type = ipsc::BURST_VOICE_HEAD;
                    user.payload = pad_payload(&lc_block, DATA_PAYLOAD_LEN);
                    bump(stream);
                    out.push(user);
                }
                stream.burst_index = 0;
            }
            FrameType::DataSync if packet.is_voice_term() => {
                if let Ok(lc_block) = flc.encode_with_rs(DTYPE_VOICE_TERM) {
                    let mut user = base_user(peer_id, packet, stream, false, ipsc::RTP_PT_TERM);
                    user.call_info |= ipsc::CALL_INFO_END;
                    user.burst_type = ipsc::BURST_VOICE_TERM;
                    user.payload = pad_payload(&lc_block, DATA_PAYLOAD_LEN);
                    bump(stream);
                    out.push(user);
                }
                self.forward.remove(&packet.stream_id);
            }
            FrameType::DataSync => {
                // CSBK and friends: the BPTC payload travels verbatim,
                // the DMR data type becomes the burst-type byte
                let info = burst::extract_info_bits(&packet.payload);
                match bptc19696::decode(&info) {
                    Ok(block) => {
                        let mut user = base_user(peer_id, packet, stream, false, ipsc::RTP_PT_VOICE);
                        user.packet_type = if packet.group_call {
                            ipsc::PKT_GROUP_DATA
                        } else {
                            ipsc::PKT_PRIVATE_DATA
                        };
                        user.burst_type = packet.dtype_vseq;
                        user.payload = pad_payload(&block, DATA_PAYLOAD_LEN);
                        bump(stream);
                        out.push(user);
                    }
                    Err(e) => {
                        tracing::warn!("IpscTranslator: BPTC decode failed on stream {:08x}: {}", packet.stream_id, e);
                    }
                }
            }
            FrameType::Voice | FrameType::VoiceSync => {
                // Repair the AMBE FEC and re-pack the three frames
                let frames = burst::extract_voice_frames(&packet.payload);
                let mut repaired = [[0u8; ambe::AMBE_BITS]; 3];
                for (i, frame) in frames.iter().enumerate() {
                    match ambe::frame_72_to_49(frame) {
                        Ok(bits) => repaired[i] = bits,
                        Err(e) => {
                            tracing::warn!("IpscTranslator: AMBE frame {} unrepairable: {}", i, e);
                            return out;
                        }
                    }
                }
                let packed = ambe::pack_frames(&repaired);

                let size = ipsc::voice_burst_size(stream.burst_index);
                let mut user = base_user(peer_id, packet, stream, false, ipsc::RTP_PT_VOICE);
                user.burst_type = match packet.slot {
                    Timeslot::Ts1 => ipsc::BURST_SLOT1_VOICE,
                    Timeslot::Ts2 => ipsc::BURST_SLOT2_VOICE,
                };
                user.payload = pad_payload(&packed, size - ipsc::USER_HEADER_LEN);
                stream.burst_index += 1;
                bump(stream);
                out.push(user);
            }
        }
        out
    }

    /// Translate one IPSC user packet back into a DMRD burst. Repeated
    /// voice headers are deduplicated; `None` means nothing to inject.
    pub fn reverse(&mut self, user: &IpscUserPacket) -> Option<DmrdPacket> {
        let stream = self.reverse.entry(user.call_control).or_insert_with(|| {
            let stream_id: StreamId = rand::random();
            tracing::debug!(
                "IpscTranslator: new reverse stream cc={:08x} -> {:08x}",
                user.call_control,
                stream_id
            );
            ReverseStream {
                stream_id,
                burst_index: 0,
                seq: 0,
                header_seen: false,
                last_activity: Instant::now(),
            }
        });
        stream.last_activity = Instant::now();

        let mut dmrd = DmrdPacket {
            seq: stream.seq,
            src: user.src,
            dst: user.dst,
            repeater: user.peer_id,
            slot: user.slot(),
            group_call: user.is_group(),
            frame_type: FrameType::DataSync,
            dtype_vseq: 0,
            stream_id: stream.stream_id,
            payload: [0u8; 33],
            ber: -1,
            rssi: -1,
        };

        match user.burst_type {
            ipsc::BURST_VOICE_HEAD => {
                if stream.header_seen {
                    return None;
                }
                stream.header_seen = true;
                let lc = FullLinkControl::for_call(user.is_group(), user.src, user.dst);
                let info = lc.encode_with_rs(DTYPE_VOICE_HEAD).ok().map(|block| bptc19696::encode(&block))?;
                dmrd.dtype_vseq = DTYPE_VOICE_HEAD;
                dmrd.payload = burst::build_data_burst(
                    &info,
                    SlotType { color_code: 1, data_type: DTYPE_VOICE_HEAD },
                    &burst::SYNC_BS_DATA,
                );
            }
            ipsc::BURST_VOICE_TERM => {
                let lc = FullLinkControl::for_call(user.is_group(), user.src, user.dst);
                let info = lc.encode_with_rs(DTYPE_VOICE_TERM).ok().map(|block| bptc19696::encode(&block))?;
                dmrd.dtype_vseq = DTYPE_VOICE_TERM;
                dmrd.payload = burst::build_data_burst(
                    &info,
                    SlotType { color_code: 1, data_type: DTYPE_VOICE_TERM },
                    &burst::SYNC_BS_DATA,
                );
                let stream_id = stream.stream_id;
                self.reverse.remove(&user.call_control);
                tracing::debug!("IpscTranslator: reverse stream {:08x} terminated", stream_id);
            }
            ipsc::BURST_SLOT1_VOICE | ipsc::BURST_SLOT2_VOICE => {
                if user.payload.len() < 19 {
                    tracing::warn!("IpscTranslator: short voice payload ({} bytes)", user.payload.len());
                    return None;
                }
                let mut packed = [0u8; 19];
                packed.copy_from_slice(&user.payload[..19]);
                let frames49 = ambe::unpack_frames(&packed);
                let frames72 = [
                    ambe::frame_49_to_72(&frames49[0]),
                    ambe::frame_49_to_72(&frames49[1]),
                    ambe::frame_49_to_72(&frames49[2]),
                ];

                let position = stream.burst_index % 6;
                if position == 0 {
                    dmrd.frame_type = FrameType::VoiceSync;
                    dmrd.dtype_vseq = 0;
                    dmrd.payload = burst::build_voice_burst(&frames72, &burst::SYNC_BS_VOICE);
                } else {
                    // embedded signalling is not reconstructed
                    dmrd.frame_type = FrameType::Voice;
                    dmrd.dtype_vseq = position as u8;
                    dmrd.payload = burst::build_voice_burst(&frames72, &[0u8; 6]);
                }
                stream.burst_index += 1;
                stream.seq = stream.seq.wrapping_add(1);
            }
            other => {
                // CSBK and data bursts carry their BPTC payload
                if user.payload.len() < 12 {
                    tracing::warn!("IpscTranslator: short data payload ({} bytes)", user.payload.len());
                    return None;
                }
                let mut block = [0u8; 12];
                block.copy_from_slice(&user.payload[..12]);
                dmrd.dtype_vseq = other & 0x0F;
                dmrd.payload = burst::build_data_burst(
                    &bptc19696::encode(&block),
                    SlotType { color_code: 1, data_type: other & 0x0F },
                    &burst::SYNC_BS_DATA,
                );
                stream.seq = stream.seq.wrapping_add(1);
            }
        }
        Some(dmrd)
    }

    /// Drop forward and reverse streams idle longer than `max_age`
    pub fn gc(&mut self) {
        let max_age = self.max_age;
        let before = self.forward.len() + self.reverse.len();
        self.forward.retain(|_, s| s.last_activity.elapsed() < max_age);
        self.reverse.retain(|_, s| s.last_activity.elapsed() < max_age);
        let dropped = before - (self.forward.len() + self.reverse.len());
        if dropped > 0 {
            tracing::debug!("IpscTranslator: gc dropped {} idle streams", dropped);
        }
    }

    pub fn stream_counts(&self) -> (usize, usize) {
        (self.forward.len(), self.reverse.len())
    }
}

fn base_user(
    peer_id: u32,
    packet: &DmrdPacket,
    stream: &ForwardStream,
    marker: bool,
    payload_type: u8,
) -> IpscUserPacket {
    let mut call_info = 0u8;
    if packet.slot == Timeslot::Ts2 {
        call_info |= ipsc::CALL_INFO_TS2;
    }
    IpscUserPacket {
        packet_type: if packet.group_call {
            ipsc::PKT_GROUP_VOICE
        } else {
            ipsc::PKT_PRIVATE_VOICE
        },
        peer_id,
        seq: stream.ipsc_seq,
        src: packet.src,
        dst: packet.dst,
        call_type: if packet.group_call { 0 } else { 1 },
        call_control: stream.call_control,
        call_info,
        rtp: RtpHeader {
            marker,
            payload_type,
            seq: stream.rtp_seq,
            timestamp: stream.rtp_timestamp,
            ssrc: packet.src,
        },
        burst_type: 0,
        payload: Vec::new(),
    }
}

/// Per emitted packet: the IPSC sequence and RTP sequence advance by
/// one, the RTP timestamp by one 60 ms burst.
fn bump(stream: &mut ForwardStream) {
    stream.ipsc_seq = stream.ipsc_seq.wrapping_add(1);
    stream.rtp_seq = stream.rtp_seq.wrapping_add(1);
    stream.rtp_timestamp = stream.rtp_timestamp.wrapping_add(ipsc::RTP_TIMESTAMP_STEP);
}

fn pad_payload(data: &[u8], len: usize) -> Vec<u8> {
    let mut payload = vec![0u8; len];
    let n = data.len().min(len);
    payload[..n].copy_from_slice(&data[..n]);
    payload
}

// ─── Ingress entity ───────────────────────────────────────────────

struct IpscPeer {
    addr: SocketAddr,
    last_seen: Instant,
}

/// The IPSC UDP worker: answers peer maintenance, verifies the
/// authenticated flavor, injects translated bursts into the router and
/// forwards group voice out to registered peers.
pub struct IpscEntity {
    config: CfgIpsc,
    router: Arc<Router>,
    translator: Mutex<IpscTranslator>,
    peers: Mutex<HashMap<u32, IpscPeer>>,
    forward_rx: Receiver<DmrdPacket>,
    stop: Arc<AtomicBool>,
}

/// Peers silent longer than this are dropped from the peer list
const PEER_TIMEOUT: Duration = Duration::from_secs(60);

impl IpscEntity {
    pub fn new(config: CfgIpsc, router: Arc<Router>, stop: Arc<AtomicBool>) -> Arc<Self> {
        let (forward_tx, forward_rx) = unbounded::<DmrdPacket>();
        router.set_ipsc_sender(forward_tx);

        let translator = IpscTranslator::new(config.peer_id, Duration::from_secs(config.stream_max_age_secs));
        Arc::new(Self {
            config,
            router,
            translator: Mutex::new(translator),
            peers: Mutex::new(HashMap::new()),
            forward_rx,
            stop,
        })
    }

    /// Bind the socket and run the worker thread. Bind failure is fatal
    /// to startup.
    pub fn start(self: &Arc<Self>) -> Result<thread::JoinHandle<()>, String> {
        let bind = format!("{}:{}", self.config.bind_host, self.config.bind_port);
        let socket = UdpSocket::bind(&bind).map_err(|e| format!("IPSC bind {} failed: {}", bind, e))?;
        socket
            .set_read_timeout(Some(Duration::from_millis(50)))
            .map_err(|e| format!("set read timeout: {}", e))?;
        tracing::info!("IpscEntity: listening on {}", bind);

        let entity = Arc::clone(self);
        thread::Builder::new()
            .name("ipsc-server".to_string())
            .spawn(move || entity.run(socket))
            .map_err(|e| format!("spawn ipsc-server: {}", e))
    }

    fn run(&self, socket: UdpSocket) {
        let mut buf = [0u8; 1024];
        let mut last_gc = Instant::now();

        while !self.stop.load(Ordering::SeqCst) {
            // Inbound from peers
            match socket.recv_from(&mut buf) {
                Ok((len, addr)) => self.handle_datagram(&buf[..len], addr, &socket),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    tracing::error!("IpscEntity: recv failed: {}", e);
                    break;
                }
            }

            // Outbound: DMRD group voice handed over by the router
            while let Ok(packet) = self.forward_rx.try_recv() {
                self.forward_to_peers(&packet, &socket);
            }

            if last_gc.elapsed() >= Duration::from_secs(1) {
                last_gc = Instant::now();
                self.translator.lock().unwrap().gc();
                self.peers.lock().unwrap().retain(|id, peer| {
                    let keep = peer.last_seen.elapsed() < PEER_TIMEOUT;
                    if !keep {
                        tracing::info!("IpscEntity: peer {} timed out", id);
                    }
                    keep
                });
            }
        }
        tracing::info!("IpscEntity: stopped");
    }

    fn handle_datagram(&self, data: &[u8], addr: SocketAddr, socket: &UdpSocket) {
        // The authenticated flavor carries a trailing truncated HMAC
        let body: &[u8] = match &self.config.auth_key {
            Some(key) => match auth::verify(data, key) {
                Some(body) => body,
                None => {
                    tracing::warn!("IpscEntity: bad digest from {}, dropping", addr);
                    return;
                }
            },
            None => data,
        };
        if body.is_empty() {
            return;
        }

        if ipsc::is_control_type(body[0]) {
            self.handle_control(body, addr, socket);
            return;
        }

        let user = match IpscUserPacket::parse(body) {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!("IpscEntity: unparseable packet from {} ({} bytes): {}", addr, data.len(), e);
                return;
            }
        };

        // Voice/data is only accepted from registered peers
        {
            let mut peers = self.peers.lock().unwrap();
            let Some(peer) = peers.get_mut(&user.peer_id) else {
                tracing::warn!("IpscEntity: user packet from unregistered peer {}", user.peer_id);
                return;
            };
            peer.last_seen = Instant::now();
            peer.addr = addr;
        }

        if let Some(dmrd) = self.translator.lock().unwrap().reverse(&user) {
            tracing::debug!("IpscEntity: <- {}", dmrd);
            self.router.route(&dmrd);
        }
    }

    fn handle_control(&self, body: &[u8], addr: SocketAddr, socket: &UdpSocket) {
        let control = match IpscControl::parse(body) {
            Ok(control) => control,
            Err(e) => {
                tracing::warn!("IpscEntity: bad control frame from {}: {}", addr, e);
                return;
            }
        };

        match control {
            IpscControl::MasterRegister { peer_id } => {
                tracing::info!("IpscEntity: peer {} registered from {}", peer_id, addr);
                self.peers.lock().unwrap().insert(
                    peer_id,
                    IpscPeer { addr, last_seen: Instant::now() },
                );
                self.send_control(&IpscControl::RegisterReply { peer_id: self.config.peer_id }, addr, socket);
            }
            IpscControl::PeerListReq { peer_id } => {
                let peers: Vec<u32> = self.peers.lock().unwrap().keys().copied().collect();
                tracing::debug!("IpscEntity: peer list to {} ({} entries)", peer_id, peers.len());
                self.send_control(
                    &IpscControl::PeerListReply { peer_id: self.config.peer_id, peers },
                    addr,
                    socket,
                );
            }
            IpscControl::AliveReq { peer_id } => {
                if let Some(peer) = self.peers.lock().unwrap().get_mut(&peer_id) {
                    peer.last_seen = Instant::now();
                    peer.addr = addr;
                }
                self.send_control(&IpscControl::AliveReply { peer_id: self.config.peer_id }, addr, socket);
            }
            IpscControl::RegisterReply { .. } | IpscControl::PeerListReply { .. } | IpscControl::AliveReply { .. } => {
                tracing::debug!("IpscEntity: ignoring reply-type control from {}", addr);
            }
        }
    }

    fn forward_to_peers(&self, packet: &DmrdPacket, socket: &UdpSocket) {
        let users = self.translator.lock().unwrap().forward(packet);
        if users.is_empty() {
            return;
        }
        let peers = self.peers.lock().unwrap();
        for user in users.iter() {
            let wire = self.seal(user.encode());
            for (peer_id, peer) in peers.iter() {
                if let Err(e) = socket.send_to(&wire, peer.addr) {
                    tracing::warn!("IpscEntity: send to peer {} failed: {}", peer_id, e);
                }
            }
        }
    }

    fn send_control(&self, control: &IpscControl, addr: SocketAddr, socket: &UdpSocket) {
        let wire = self.seal(control.encode());
        if let Err(e) = socket.send_to(&wire, addr) {
            tracing::warn!("IpscEntity: send control to {} failed: {}", addr, e);
        }
    }

    fn seal(&self, body: Vec<u8>) -> Vec<u8> {
        match &self.config.auth_key {
            Some(key) => auth::sign(&body, key),
            None => body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> IpscTranslator {
        IpscTranslator::new(9000, Duration::from_secs(3))
    }

    fn voice_head(stream_id: u32) -> DmrdPacket {
        DmrdPacket {
            seq: 0,
            src: 311860,
            dst: 3100,
            repeater: 1001,
            slot: Timeslot::Ts1,
            group_call: true,
            frame_type: FrameType::DataSync,
            dtype_vseq: DTYPE_VOICE_HEAD,
            stream_id,
            payload: [0u8; 33],
            ber: -1,
            rssi: -1,
        }
    }

    fn voice_burst(stream_id: u32, frame_type: FrameType, vseq: u8) -> DmrdPacket {
        // a burst with valid AMBE FEC, as over-the-air frames have
        let mut bits = [0u8; ambe::AMBE_BITS];
        for (i, slot) in bits.iter_mut().enumerate() {
            *slot = ((i * 3 + vseq as usize) % 2) as u8;
        }
        let frame = ambe::frame_49_to_72(&bits);
        let centre = if frame_type == FrameType::VoiceSync {
            burst::SYNC_BS_VOICE
        } else {
            [0u8; 6]
        };
        let payload = burst::build_voice_burst(&[frame, frame, frame], &centre);

        let mut packet = voice_head(stream_id);
        packet.frame_type = frame_type;
        packet.dtype_vseq = vseq;
        packet.payload = payload;
        packet
    }

    fn voice_term(stream_id: u32) -> DmrdPacket {
        let mut packet = voice_head(stream_id);
        packet.dtype_vseq = DTYPE_VOICE_TERM;
        packet
    }

    #[test]
    fn test_forward_header_emits_three() {
        let mut t = translator();
        let out = t.forward(&voice_head(42));
        assert_eq!(out.len(), 3);
        assert!(out[0].rtp.marker);
        assert!(!out[1].rtp.marker);
        assert!(!out[2].rtp.marker);
        for user in out.iter() {
            assert_eq!(user.burst_type, ipsc::BURST_VOICE_HEAD);
            assert_eq!(user.peer_id, 9000);
            assert_eq!(user.src, 311860);
            assert_eq!(user.dst, 3100);
            assert_eq!(user.encode().len(), ipsc::SIZE_DATA);
        }
        // one forward stream, sequences advanced by three
        assert_eq!(t.stream_counts(), (1, 0));
    }

    #[test]
    fn test_forward_superframe_sizes() {
        let mut t = translator();
        t.forward(&voice_head(42));
        let mut sizes = Vec::new();
        sizes.push(t.forward(&voice_burst(42, FrameType::VoiceSync, 0))[0].encode().len());
        for vseq in 1..=5u8 {
            sizes.push(t.forward(&voice_burst(42, FrameType::Voice, vseq))[0].encode().len());
        }
        assert_eq!(sizes, vec![52, 57, 57, 57, 66, 57]);
    }

    #[test]
    fn test_forward_rtp_sequencing() {
        let mut t = translator();
        let headers = t.forward(&voice_head(42));
        assert_eq!(headers[0].rtp.seq, 0);
        assert_eq!(headers[2].rtp.seq, 2);
        let burst = &t.forward(&voice_burst(42, FrameType::VoiceSync, 0))[0];
        assert_eq!(burst.rtp.seq, 3);
        assert_eq!(burst.rtp.timestamp, 3 * ipsc::RTP_TIMESTAMP_STEP);
        assert_eq!(burst.seq, 3);
    }

    #[test]
    fn test_forward_terminator_clears_stream() {
        let mut t = translator();
        t.forward(&voice_head(42));
        let out = t.forward(&voice_term(42));
        assert_eq!(out.len(), 1);
        assert!(out[0].is_end());
        assert_eq!(out[0].rtp.payload_type, ipsc::RTP_PT_TERM);
        assert_eq!(t.stream_counts(), (0, 0));
    }

    #[test]
    fn test_round_trip_preserves_call_identity() {
        // forward a header + six bursts + terminator, feed everything
        // back: 3 headers dedupe to one, voice and terminator survive
        let mut t = translator();
        let mut wire = Vec::new();
        wire.extend(t.forward(&voice_head(42)));
        wire.extend(t.forward(&voice_burst(42, FrameType::VoiceSync, 0)));
        for vseq in 1..=5u8 {
            wire.extend(t.forward(&voice_burst(42, FrameType::Voice, vseq)));
        }
        wire.extend(t.forward(&voice_term(42)));
        assert_eq!(wire.len(), 3 + 6 + 1);

        let mut back = Vec::new();
        for user in wire.iter() {
            if let Some(dmrd) = t.reverse(user) {
                back.push(dmrd);
            }
        }
        assert_eq!(back.len(), 1 + 6 + 1);

        assert!(back[0].is_voice_head());
        assert_eq!(back[0].frame_type, FrameType::DataSync);
        assert!(back[7].is_voice_term());
        assert_eq!(back[1].frame_type, FrameType::VoiceSync);
        for (i, dmrd) in back.iter().enumerate() {
            assert_eq!(dmrd.src, 311860, "packet {}", i);
            assert_eq!(dmrd.dst, 3100, "packet {}", i);
            assert_eq!(dmrd.slot, Timeslot::Ts1, "packet {}", i);
            assert!(dmrd.group_call, "packet {}", i);
        }
        // voice sequence numbering reconstructed
        for (i, dmrd) in back[2..7].iter().enumerate() {
            assert_eq!(dmrd.frame_type, FrameType::Voice);
            assert_eq!(dmrd.dtype_vseq as usize, i + 1);
        }
        // one shared stream id across the reverse call
        let stream_id = back[0].stream_id;
        assert!(back.iter().all(|p| p.stream_id == stream_id));
    }

    #[test]
    fn test_reverse_voice_payload_survives() {
        let mut t = translator();
        t.forward(&voice_head(42));
        let sent = voice_burst(42, FrameType::VoiceSync, 0);
        let user = t.forward(&sent)[0].clone();
        let got = t.reverse(&user).unwrap();
        // the voice bits come back identical after FEC strip + re-add
        assert_eq!(
            burst::extract_voice_frames(&got.payload),
            burst::extract_voice_frames(&sent.payload)
        );
    }

    #[test]
    fn test_reverse_slot_and_end_flags() {
        let mut t = translator();
        let mut head = voice_head(42);
        head.slot = Timeslot::Ts2;
        head.group_call = false;
        let users = t.forward(&head);
        assert_eq!(users[0].call_info & ipsc::CALL_INFO_TS2, ipsc::CALL_INFO_TS2);
        assert_eq!(users[0].packet_type, ipsc::PKT_PRIVATE_VOICE);

        let back = t.reverse(&users[0]).unwrap();
        assert_eq!(back.slot, Timeslot::Ts2);
        assert!(!back.group_call);
    }

    #[test]
    fn test_gc_drops_idle_streams() {
        let mut t = IpscTranslator::new(9000, Duration::from_millis(0));
        t.forward(&voice_head(42));
        assert_eq!(t.stream_counts(), (1, 0));
        t.gc();
        assert_eq!(t.stream_counts(), (0, 0));
    }
}
