//! The Homebrew/MMDVM UDP server: socket threads, the per-repeater
//! handshake state machine, keep-alive handling, and DMRD validation
//! ahead of routing.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, bounded};
use sha2::{Digest, Sha256};

use dmr_config::SharedConfig;
use dmr_pdus::hbrp::{self, Command, DmrdPacket, RptcFrame};

use crate::instance::InstanceRegistry;
use crate::repeater::{ConnectionState, RepeaterSession, SessionClient};
use crate::router::Router;
use crate::store::bus::{PubSub, RawDatagram, TOPIC_OUTGOING};
use crate::store::db::Db;

/// Delay before the RPTSBKN beacon that follows a successful key exchange
const SBKN_DELAY: Duration = Duration::from_secs(1);
/// LastPing writes are coalesced to at most one per repeater per second
const PING_DB_DEBOUNCE: Duration = Duration::from_secs(1);
/// Socket read timeout, bounding how long shutdown waits on the reader
const READ_TIMEOUT: Duration = Duration::from_millis(250);

pub struct HbrpServer {
    config: SharedConfig,
    db: Db,
    sessions: SessionClient,
    router: Arc<Router>,
    bus: Arc<dyn PubSub>,
    registry: InstanceRegistry,
    stopped: Arc<AtomicBool>,
    outgoing_tx: Sender<(Vec<u8>, SocketAddr)>,
    outgoing_rx: Receiver<(Vec<u8>, SocketAddr)>,
    socket: std::sync::Mutex<Option<UdpSocket>>,
    workers: std::sync::Mutex<Vec<thread::JoinHandle<()>>>,
}

impl HbrpServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SharedConfig,
        db: Db,
        sessions: SessionClient,
        router: Arc<Router>,
        bus: Arc<dyn PubSub>,
        registry: InstanceRegistry,
        stopped: Arc<AtomicBool>,
        outgoing_tx: Sender<(Vec<u8>, SocketAddr)>,
        outgoing_rx: Receiver<(Vec<u8>, SocketAddr)>,
    ) -> Self {
        Self {
            config,
            db,
            sessions,
            router,
            bus,
            registry,
            stopped,
            outgoing_tx,
            outgoing_rx,
            socket: std::sync::Mutex::new(None),
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Producers enqueue replies and forwarded packets here; a single
    /// sender thread owns the socket writes.
    pub fn outgoing(&self) -> Sender<(Vec<u8>, SocketAddr)> {
        self.outgoing_tx.clone()
    }

    /// Bind the socket and spawn the reader / handler / sender / bus
    /// drain threads. Bind failure is fatal to startup.
    pub fn start(self: &Arc<Self>) -> Result<(), String> {
        let cfg = &self.config.config().hbrp;
        let bind = format!("{}:{}", cfg.bind_host, cfg.bind_port);
        let socket = UdpSocket::bind(&bind).map_err(|e| format!("UDP bind {} failed: {}", bind, e))?;
        socket
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| format!("set read timeout: {}", e))?;
        tracing::info!("HbrpServer: listening on {}", bind);

        let (incoming_tx, incoming_rx) = bounded::<(Vec<u8>, SocketAddr)>(cfg.incoming_queue);

        let reader_socket = socket.try_clone().map_err(|e| format!("clone socket: {}", e))?;
        let sender_socket = socket.try_clone().map_err(|e| format!("clone socket: {}", e))?;
        *self.socket.lock().unwrap() = Some(socket);

        let mut workers = self.workers.lock().unwrap();

        // Reader: copy each datagram out of the socket buffer and hand
        // it to the single handler. Overflow drops the datagram.
        {
            let stopped = self.stopped.clone();
            workers.push(
                thread::Builder::new()
                    .name("hbrp-reader".to_string())
                    .spawn(move || {
                        let mut buf = [0u8; 1024];
                        while !stopped.load(Ordering::SeqCst) {
                            match reader_socket.recv_from(&mut buf) {
                                Ok((len, addr)) => {
                                    if incoming_tx.try_send((buf[..len].to_vec(), addr)).is_err() {
                                        tracing::warn!("HbrpServer: incoming queue full, dropping datagram");
                                    }
                                }
                                Err(e)
                                    if e.kind() == std::io::ErrorKind::WouldBlock
                                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                                Err(e) => {
                                    if !stopped.load(Ordering::SeqCst) {
                                        tracing::error!("HbrpServer: recv failed: {}", e);
                                    }
                                    break;
                                }
                            }
                        }
                        tracing::debug!("HbrpServer: reader stopped");
                    })
                    .map_err(|e| format!("spawn reader: {}", e))?,
            );
        }

        // Handler: the dispatch state machine. Single consumer, so
        // per-stream ingress order is preserved.
        {
            let server = Arc::clone(self);
            workers.push(
                thread::Builder::new()
                    .name("hbrp-handler".to_string())
                    .spawn(move || {
                        let mut ping_debounce: HashMap<u32, Instant> = HashMap::new();
                        loop {
                            match incoming_rx.recv_timeout(Duration::from_millis(250)) {
                                Ok((data, addr)) => server.handle_packet(&data, addr, &mut ping_debounce),
                                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                                    if server.stopped.load(Ordering::SeqCst) {
                                        break;
                                    }
                                }
                                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                            }
                        }
                        tracing::debug!("HbrpServer: handler stopped");
                    })
                    .map_err(|e| format!("spawn handler: {}", e))?,
            );
        }

        // Sender: sole writer of the socket
        {
            let stopped = self.stopped.clone();
            let outgoing_rx = self.outgoing_rx.clone();
            workers.push(
                thread::Builder::new()
                    .name("hbrp-sender".to_string())
                    .spawn(move || {
                        loop {
                            match outgoing_rx.recv_timeout(Duration::from_millis(250)) {
                                Ok((data, addr)) => {
                                    if let Err(e) = sender_socket.send_to(&data, addr) {
                                        tracing::error!("HbrpServer: send to {} failed: {}", addr, e);
                                    }
                                }
                                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                                    if stopped.load(Ordering::SeqCst) {
                                        break;
                                    }
                                }
                                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                            }
                        }
                        tracing::debug!("HbrpServer: sender stopped");
                    })
                    .map_err(|e| format!("spawn sender: {}", e))?,
            );
        }

        // Bus drain: raw datagrams published by any replica (the router's
        // fan-out path) transmit through the local socket
        {
            let stopped = self.stopped.clone();
            let outgoing_tx = self.outgoing_tx.clone();
            let bus_rx = self
                .bus
                .subscribe(TOPIC_OUTGOING)
                .map_err(|e| format!("subscribe {}: {}", TOPIC_OUTGOING, e))?;
            workers.push(
                thread::Builder::new()
                    .name("hbrp-bus-drain".to_string())
                    .spawn(move || {
                        loop {
                            match bus_rx.recv_timeout(Duration::from_millis(250)) {
                                Ok(payload) => match RawDatagram::from_msgpack(&payload) {
                                    Ok(datagram) => {
                                        let addr = format!("{}:{}", datagram.remote_ip, datagram.remote_port);
                                        match addr.parse::<SocketAddr>() {
                                            Ok(addr) => {
                                                // blocks when the queue is full: intentional backpressure
                                                let _ = outgoing_tx.send((datagram.data, addr));
                                            }
                                            Err(e) => {
                                                tracing::warn!("HbrpServer: bad bus endpoint {}: {}", addr, e)
                                            }
                                        }
                                    }
                                    Err(e) => tracing::warn!("HbrpServer: bad bus payload: {}", e),
                                },
                                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                                    if stopped.load(Ordering::SeqCst) {
                                        break;
                                    }
                                }
                                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                            }
                        }
                        tracing::debug!("HbrpServer: bus drain stopped");
                    })
                    .map_err(|e| format!("spawn bus drain: {}", e))?,
            );
        }

        Ok(())
    }

    // ─── Dispatch ─────────────────────────────────────────────────

    fn handle_packet(&self, data: &[u8], addr: SocketAddr, ping_debounce: &mut HashMap<u32, Instant>) {
        if self.stopped.load(Ordering::SeqCst) {
            // shutdown in flight: drop inbound, the send queues drain
            return;
        }

        let command = match Command::parse(data) {
            Ok(command) => command,
            Err(e) => {
                // A malformed RPTC still identifies its sender; the
                // protocol wants a NAK rather than silence
                if data.starts_with(hbrp::CMD_RPTC) && !data.starts_with(hbrp::CMD_RPTCL) && data.len() >= 8 {
                    let id = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
                    tracing::warn!("HbrpServer: bad RPTC from {}: {}", id, e);
                    self.reply(hbrp::build_mstnak(id), addr);
                    return;
                }
                let token_len = data.len().min(7);
                tracing::warn!(
                    "HbrpServer: unparseable datagram len={} command={:?}: {}",
                    data.len(),
                    String::from_utf8_lossy(&data[..token_len]),
                    e
                );
                return;
            }
        };

        match command {
            Command::Login { repeater_id } => self.rx_login(repeater_id, addr),
            Command::Key { repeater_id, hash } => self.rx_key(repeater_id, hash, addr),
            Command::Config { repeater_id, frame } => self.rx_config(repeater_id, frame, addr),
            Command::Ping { repeater_id } => self.rx_ping(repeater_id, addr, ping_debounce),
            Command::Closing { repeater_id } => self.rx_closing(repeater_id, addr),
            Command::TalkerAlias { repeater_id, alias } => {
                tracing::info!(
                    "HbrpServer: <- DMRA from {}: {:?}",
                    repeater_id,
                    String::from_utf8_lossy(&alias)
                );
            }
            Command::Options { repeater_id, options } => {
                tracing::info!("HbrpServer: <- RPTO from {}: {}", repeater_id, options.trim());
            }
            Command::Dmrd(packet) => self.rx_dmrd(packet, addr, ping_debounce),
        }
    }

    /// The per-repeater precondition: a live session in the named state.
    /// Any mismatch is answered with MSTNAK.
    fn valid_repeater(&self, id: u32, expected: ConnectionState, addr: SocketAddr) -> Option<RepeaterSession> {
        match self.sessions.get(id) {
            Ok(session) if session.connection == expected => Some(session),
            Ok(session) => {
                tracing::warn!(
                    "HbrpServer: repeater {} in state {} (expected {})",
                    id,
                    session.connection,
                    expected
                );
                self.reply(hbrp::build_mstnak(id), addr);
                None
            }
            Err(e) => {
                tracing::warn!("HbrpServer: no session for {}: {}", id, e);
                self.reply(hbrp::build_mstnak(id), addr);
                None
            }
        }
    }

    // ─── Handshake ────────────────────────────────────────────────

    fn rx_login(&self, id: u32, addr: SocketAddr) {
        match self.db.repeater_exists(id) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("HbrpServer: login from unregistered id {}", id);
                self.reply(hbrp::build_mstnak(id), addr);
                return;
            }
            Err(e) => {
                tracing::error!("HbrpServer: repeater lookup failed: {}", e);
                self.reply(hbrp::build_mstnak(id), addr);
                return;
            }
        }

        let salt: u32 = rand::random();
        let mut session = RepeaterSession::new(id, addr, salt);
        if let Err(e) = self.sessions.store(&session) {
            tracing::error!("HbrpServer: storing session {} failed: {}", id, e);
            return;
        }

        tracing::info!("HbrpServer: <- RPTL from {} at {}", id, addr);
        self.reply(hbrp::build_rptack_salt(salt), addr);

        session.connection = ConnectionState::ChallengeSent;
        if let Err(e) = self.sessions.store(&session) {
            tracing::error!("HbrpServer: storing session {} failed: {}", id, e);
        }
    }

    fn rx_key(&self, id: u32, hash: [u8; 32], addr: SocketAddr) {
        let Some(mut session) = self.valid_repeater(id, ConnectionState::ChallengeSent, addr) else {
            return;
        };

        let password = match self.db.repeater_password(id) {
            Ok(Some(password)) => password,
            Ok(None) | Err(_) => {
                tracing::warn!("HbrpServer: no password on record for {}", id);
                self.reply(hbrp::build_mstnak(id), addr);
                return;
            }
        };

        // The protocol compares only the high 32 bits of the SHA-256
        let mut hasher = Sha256::new();
        hasher.update(session.salt.to_be_bytes());
        hasher.update(password.as_bytes());
        let expected = hasher.finalize();
        let expected_word = u32::from_be_bytes([expected[0], expected[1], expected[2], expected[3]]);
        let got_word = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);

        if expected_word != got_word {
            tracing::warn!("HbrpServer: auth failure for {}", id);
            self.reply(hbrp::build_mstnak(id), addr);
            return;
        }

        tracing::info!("HbrpServer: repeater {} authenticated", id);
        self.reply(hbrp::build_rptack_id(id), addr);
        session.connection = ConnectionState::WaitingConfig;
        if let Err(e) = self.sessions.store(&session) {
            tracing::error!("HbrpServer: storing session {} failed: {}", id, e);
            return;
        }

        // Beacon shortly after the key exchange
        let outgoing = self.outgoing_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("hbrp-sbkn-{}", id))
            .spawn(move || {
                thread::sleep(SBKN_DELAY);
                let _ = outgoing.send((hbrp::build_rptsbkn(id), addr));
            });
        if let Err(e) = spawned {
            tracing::error!("HbrpServer: failed to spawn beacon thread: {}", e);
        }
    }

    fn rx_config(&self, id: u32, frame: RptcFrame, addr: SocketAddr) {
        let Some(mut session) = self.valid_repeater(id, ConnectionState::WaitingConfig, addr) else {
            return;
        };

        tracing::info!(
            "HbrpServer: <- RPTC from {}: callsign {} cc {}",
            id,
            frame.callsign,
            frame.color_code
        );

        let now = Utc::now();
        session.config = Some((&frame).into());
        session.connection = ConnectionState::Connected;
        session.connected_at_ms = now.timestamp_millis();
        session.last_ping_ms = now.timestamp_millis();
        if let Err(e) = self.sessions.store(&session) {
            tracing::error!("HbrpServer: storing session {} failed: {}", id, e);
            self.reply(hbrp::build_mstnak(id), addr);
            return;
        }

        // Mirror into the durable row; connect events bypass the ping
        // debounce by design of the debounce map (it only gates pings)
        if let Err(e) = self.db.update_repeater_config(id, &frame) {
            tracing::error!("HbrpServer: mirroring config of {} failed: {}", id, e);
        }
        if let Err(e) = self.db.mark_connected(id, now) {
            tracing::error!("HbrpServer: marking {} connected failed: {}", id, e);
        }

        self.reply(hbrp::build_rptack_id(id), addr);
    }

    fn rx_ping(&self, id: u32, addr: SocketAddr, ping_debounce: &mut HashMap<u32, Instant>) {
        if self
            .valid_repeater(id, ConnectionState::Connected, addr)
            .is_none()
        {
            return;
        }

        let now = Utc::now();
        if let Err(e) = self.sessions.update_ping(id, addr, now.timestamp_millis()) {
            tracing::warn!("HbrpServer: ping refresh of {} failed: {}", id, e);
        }
        self.touch_last_ping_debounced(id, now, ping_debounce);

        self.reply(hbrp::build_mstpong(id), addr);
    }

    fn rx_closing(&self, id: u32, addr: SocketAddr) {
        if self
            .valid_repeater(id, ConnectionState::Connected, addr)
            .is_none()
        {
            return;
        }

        tracing::info!("HbrpServer: repeater {} closing", id);
        // The protocol answers a close with a NAK, intentionally
        self.reply(hbrp::build_mstnak(id), addr);
        if let Err(e) = self.sessions.delete(id) {
            tracing::warn!("HbrpServer: deleting session {} failed: {}", id, e);
        }
    }

    // ─── Data plane ───────────────────────────────────────────────

    fn rx_dmrd(&self, packet: DmrdPacket, addr: SocketAddr, ping_debounce: &mut HashMap<u32, Instant>) {
        if self
            .valid_repeater(packet.repeater, ConnectionState::Connected, addr)
            .is_none()
        {
            return;
        }

        // Every packet from a live id refreshes its session TTL and
        // (debounced) its durable liveness
        if let Err(e) = self.sessions.touch(packet.repeater) {
            tracing::warn!("HbrpServer: touching session {} failed: {}", packet.repeater, e);
        }
        self.touch_last_ping_debounced(packet.repeater, Utc::now(), ping_debounce);

        tracing::debug!("HbrpServer: <- {}", packet);
        self.router.route(&packet);
    }

    fn touch_last_ping_debounced(
        &self,
        id: u32,
        now: chrono::DateTime<Utc>,
        ping_debounce: &mut HashMap<u32, Instant>,
    ) {
        let due = match ping_debounce.get(&id) {
            Some(last) => last.elapsed() >= PING_DB_DEBOUNCE,
            None => true,
        };
        if !due {
            return;
        }
        ping_debounce.insert(id, Instant::now());
        if let Err(e) = self.db.touch_last_ping(id, now) {
            tracing::error!("HbrpServer: LastPing write for {} failed: {}", id, e);
        }
    }

    fn reply(&self, data: Vec<u8>, addr: SocketAddr) {
        // blocks when the queue is full: intentional backpressure
        if self.outgoing_tx.send((data, addr)).is_err() {
            tracing::error!("HbrpServer: outgoing queue closed");
        }
    }

    // ─── Shutdown ─────────────────────────────────────────────────

    /// Graceful shutdown: optionally broadcast MSTCL, stop the workers,
    /// close the socket last. Calling it twice is a no-op.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        // With another instance alive the repeaters are picked up there;
        // skip the disconnect broadcast for a seamless handoff
        let others = self.registry.others_alive().unwrap_or(false);
        if others {
            tracing::info!("HbrpServer: other instances live, skipping MSTCL broadcast");
        } else {
            let ids = self.sessions.list().unwrap_or_default();
            tracing::info!("HbrpServer: disconnecting {} repeaters", ids.len());
            for id in ids {
                let Ok(session) = self.sessions.get(id) else {
                    continue;
                };
                if session.connection != ConnectionState::Connected {
                    continue;
                }
                if let Some(addr) = session.addr() {
                    // sender thread drains these before exiting
                    let _ = self.outgoing_tx.send((hbrp::build_mstcl(id), addr));
                }
                if let Err(e) = self.sessions.update_connection(id, ConnectionState::Disconnected) {
                    tracing::warn!("HbrpServer: marking {} disconnected failed: {}", id, e);
                }
            }
        }

        // Give the workers a bounded window to drain and exit
        let deadline = Instant::now() + Duration::from_secs(3);
        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in workers {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(50));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::warn!("HbrpServer: worker did not stop in time, abandoning");
            }
        }

        // Socket closes last, unblocking any straggling reader
        *self.socket.lock().unwrap() = None;
        tracing::info!("HbrpServer: stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::CallTracker;
    use crate::store::{MemoryBus, MemoryKv};
    use dmr_config::toml_config;
    use dmr_core::Timeslot;
    use dmr_pdus::hbrp::{DTYPE_VOICE_HEAD, FrameType};

    struct Fixture {
        server: Arc<HbrpServer>,
        db: Db,
        sessions: SessionClient,
        out_rx: Receiver<(Vec<u8>, SocketAddr)>,
        bus: Arc<MemoryBus>,
    }

    fn fixture() -> Fixture {
        let config = toml_config::from_toml_str("config_version = \"0.3\"\n").unwrap();
        let kv: Arc<dyn crate::store::KvStore> = Arc::new(MemoryKv::new());
        let db = Db::open(":memory:").unwrap();
        let sessions = SessionClient::new(kv.clone());
        let bus = Arc::new(MemoryBus::new());
        let tracker = Arc::new(CallTracker::new(db.clone()));
        let router = Arc::new(Router::new(
            db.clone(),
            sessions.clone(),
            tracker,
            None,
            bus.clone(),
        ));
        let registry = InstanceRegistry::new(kv);
        let (out_tx, out_rx) = crossbeam_channel::unbounded();
        let server = Arc::new(HbrpServer::new(
            config,
            db.clone(),
            sessions.clone(),
            router,
            bus.clone(),
            registry,
            Arc::new(AtomicBool::new(false)),
            out_tx,
            out_rx.clone(),
        ));
        Fixture { server, db, sessions, out_rx, bus }
    }

    fn addr() -> SocketAddr {
        "192.0.2.10:50123".parse().unwrap()
    }

    fn handle(f: &Fixture, data: &[u8]) {
        let mut debounce = HashMap::new();
        f.server.handle_packet(data, addr(), &mut debounce);
    }

    fn next_reply(f: &Fixture) -> Vec<u8> {
        loop {
            let (data, _) = f
                .out_rx
                .recv_timeout(Duration::from_secs(2))
                .expect("expected a reply");
            // the delayed beacon may interleave with direct replies
            if data.starts_with(hbrp::REPLY_RPTSBKN) {
                continue;
            }
            return data;
        }
    }

    fn rptl(id: u32) -> Vec<u8> {
        let mut wire = Vec::from(hbrp::CMD_RPTL);
        wire.extend_from_slice(&id.to_be_bytes());
        wire
    }

    fn rptk(id: u32, salt: u32, password: &str) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(salt.to_be_bytes());
        hasher.update(password.as_bytes());
        let digest = hasher.finalize();

        let mut wire = Vec::from(hbrp::CMD_RPTK);
        wire.extend_from_slice(&id.to_be_bytes());
        wire.extend_from_slice(&digest);
        wire
    }

    fn rptc(id: u32) -> Vec<u8> {
        let frame = RptcFrame {
            callsign: "PD0TST".into(),
            rx_freq: 438_800_000,
            tx_freq: 431_200_000,
            tx_power: 10,
            color_code: 1,
            latitude: 52.37,
            longitude: 4.89,
            height: 15,
            location: "Amsterdam".into(),
            description: "".into(),
            slots: 2,
            url: "".into(),
            software_id: "MMDVM_MMDVM_HS_Hat".into(),
            package_id: "".into(),
        };
        let mut wire = Vec::from(hbrp::CMD_RPTC);
        wire.extend_from_slice(&id.to_be_bytes());
        wire.extend_from_slice(&frame.encode());
        wire
    }

    /// Drives RPTL + RPTK + RPTC to CONNECTED, returning the salt reply
    fn connect(f: &Fixture, id: u32, password: &str) {
        handle(f, &rptl(id));
        let challenge = next_reply(f);
        assert_eq!(&challenge[..6], hbrp::REPLY_RPTACK);
        let salt = u32::from_be_bytes([challenge[6], challenge[7], challenge[8], challenge[9]]);

        handle(f, &rptk(id, salt, password));
        assert_eq!(next_reply(f), hbrp::build_rptack_id(id));

        handle(f, &rptc(id));
        assert_eq!(next_reply(f), hbrp::build_rptack_id(id));
    }

    #[test]
    fn test_handshake_happy_path() {
        let f = fixture();
        f.db.create_repeater(311860, None, "s3cr37w0rd").unwrap();
        connect(&f, 311860, "s3cr37w0rd");

        let session = f.sessions.get(311860).unwrap();
        assert_eq!(session.connection, ConnectionState::Connected);
        assert_eq!(session.config.as_ref().unwrap().callsign, "PD0TST");
        // DB mirrored
        let rpt = f.db.get_repeater(311860).unwrap().unwrap();
        assert_eq!(rpt.callsign, "PD0TST");
        assert!(rpt.connected_at.is_some());
    }

    #[test]
    fn test_login_unknown_id_nak() {
        let f = fixture();
        handle(&f, &rptl(999999));
        assert_eq!(next_reply(&f), hbrp::build_mstnak(999999));
        assert!(!f.sessions.exists(999999).unwrap());
    }

    #[test]
    fn test_wrong_password_keeps_state() {
        let f = fixture();
        f.db.create_repeater(311860, None, "s3cr37w0rd").unwrap();
        handle(&f, &rptl(311860));
        let challenge = next_reply(&f);
        let salt = u32::from_be_bytes([challenge[6], challenge[7], challenge[8], challenge[9]]);

        handle(&f, &rptk(311860, salt, "wrong"));
        assert_eq!(next_reply(&f), hbrp::build_mstnak(311860));
        assert_eq!(
            f.sessions.get(311860).unwrap().connection,
            ConnectionState::ChallengeSent
        );
    }

    #[test]
    fn test_key_without_login_nak() {
        let f = fixture();
        f.db.create_repeater(311860, None, "pw").unwrap();
        handle(&f, &rptk(311860, 1234, "pw"));
        assert_eq!(next_reply(&f), hbrp::build_mstnak(311860));
    }

    #[test]
    fn test_bad_rptc_field_naks() {
        let f = fixture();
        f.db.create_repeater(311860, None, "pw").unwrap();
        handle(&f, &rptl(311860));
        let challenge = next_reply(&f);
        let salt = u32::from_be_bytes([challenge[6], challenge[7], challenge[8], challenge[9]]);
        handle(&f, &rptk(311860, salt, "pw"));
        assert_eq!(next_reply(&f), hbrp::build_rptack_id(311860));

        let mut wire = rptc(311860);
        wire[8 + 8] = b'x'; // corrupt rx_freq
        handle(&f, &wire);
        assert_eq!(next_reply(&f), hbrp::build_mstnak(311860));
        // still waiting for a valid config
        assert_eq!(
            f.sessions.get(311860).unwrap().connection,
            ConnectionState::WaitingConfig
        );
    }

    #[test]
    fn test_ping_pong_and_endpoint_refresh() {
        let f = fixture();
        f.db.create_repeater(311860, None, "pw").unwrap();
        connect(&f, 311860, "pw");

        let mut wire = Vec::from(hbrp::CMD_RPTPING);
        wire.extend_from_slice(&311860u32.to_be_bytes());
        handle(&f, &wire);
        assert_eq!(next_reply(&f), hbrp::build_mstpong(311860));

        let session = f.sessions.get(311860).unwrap();
        assert_eq!(session.pings_received, 1);
        assert_eq!(session.port, addr().port());
        assert!(f.db.get_repeater(311860).unwrap().unwrap().last_ping.is_some());
    }

    #[test]
    fn test_ping_before_connected_nak() {
        let f = fixture();
        f.db.create_repeater(311860, None, "pw").unwrap();
        handle(&f, &rptl(311860));
        let _ = next_reply(&f);

        let mut wire = Vec::from(hbrp::CMD_RPTPING);
        wire.extend_from_slice(&311860u32.to_be_bytes());
        handle(&f, &wire);
        assert_eq!(next_reply(&f), hbrp::build_mstnak(311860));
    }

    #[test]
    fn test_closing_deletes_session() {
        let f = fixture();
        f.db.create_repeater(311860, None, "pw").unwrap();
        connect(&f, 311860, "pw");

        let mut wire = Vec::from(hbrp::CMD_RPTCL);
        wire.extend_from_slice(&311860u32.to_be_bytes());
        handle(&f, &wire);
        // the close is answered with a NAK, per protocol
        assert_eq!(next_reply(&f), hbrp::build_mstnak(311860));
        assert!(!f.sessions.exists(311860).unwrap());
    }

    #[test]
    fn test_dmrd_requires_connected_session() {
        let f = fixture();
        f.db.create_repeater(1001, None, "pw").unwrap();
        let packet = DmrdPacket {
            seq: 0,
            src: 311860,
            dst: 3100,
            repeater: 1001,
            slot: Timeslot::Ts1,
            group_call: true,
            frame_type: FrameType::DataSync,
            dtype_vseq: DTYPE_VOICE_HEAD,
            stream_id: 42,
            payload: [0u8; 33],
            ber: -1,
            rssi: -1,
        };
        handle(&f, &packet.encode());
        assert_eq!(next_reply(&f), hbrp::build_mstnak(1001));
    }

    #[test]
    fn test_group_fanout_end_to_end() {
        let f = fixture();
        f.db.create_user(311860, "PD0TST").unwrap();
        f.db.create_talkgroup(3100, "Test").unwrap();
        f.db.create_repeater(1001, None, "pw-a").unwrap();
        f.db.create_repeater(2002, None, "pw-b").unwrap();
        f.db.add_static(2002, Timeslot::Ts1, 3100).unwrap();
        connect(&f, 1001, "pw-a");
        connect(&f, 2002, "pw-b");

        let bus_rx = f.bus.subscribe(TOPIC_OUTGOING).unwrap();
        let packet = DmrdPacket {
            seq: 0,
            src: 311860,
            dst: 3100,
            repeater: 1001,
            slot: Timeslot::Ts1,
            group_call: true,
            frame_type: FrameType::DataSync,
            dtype_vseq: DTYPE_VOICE_HEAD,
            stream_id: 42,
            payload: [0x42; 33],
            ber: -1,
            rssi: -1,
        };
        handle(&f, &packet.encode());

        let payload = bus_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let datagram = RawDatagram::from_msgpack(&payload).unwrap();
        let delivered = DmrdPacket::parse(&datagram.data).unwrap();
        assert_eq!(delivered.repeater, 2002);
        assert_eq!(delivered.payload, packet.payload);

        // the call row was opened with the header accounted
        let call = f
            .db
            .find_active_call(42, 311860, 3100, Timeslot::Ts1, true)
            .unwrap()
            .unwrap();
        assert!(call.active);
        assert!(call.has_header);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let f = fixture();
        f.server.stop();
        f.server.stop();
        // packets after stop are discarded
        handle(&f, &rptl(311860));
        assert!(f.out_rx.try_recv().is_err());
    }
}
