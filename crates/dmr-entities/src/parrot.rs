//! The parrot loopback service: records a caller's stream destined for
//! talkgroup 9990 and replays it back, src and dst swapped, three
//! seconds after the terminator at a strict 60 ms cadence.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use dmr_core::StreamId;
use dmr_pdus::hbrp::DmrdPacket;

use crate::calls::CallTracker;
use crate::repeater::SessionClient;
use crate::store::{KvError, KvStore};

/// Stream state expires five minutes after the last recorded burst
pub const PARROT_TTL: Duration = Duration::from_secs(300);
/// Pause between the caller's terminator and the replay
pub const REPLAY_DELAY: Duration = Duration::from_secs(3);
/// Replay pacing per burst
pub const FRAME_PACING: Duration = Duration::from_millis(60);

fn owner_key(stream_id: StreamId) -> String {
    format!("parrot:stream:{}", stream_id)
}

fn packets_key(stream_id: StreamId) -> String {
    format!("parrot:stream:{}:packets", stream_id)
}

/// Per-stream recording state in the shared KV: the owner repeater id
/// under `parrot:stream:{id}` and the ordered burst log under
/// `parrot:stream:{id}:packets`.
#[derive(Clone)]
pub struct ParrotStore {
    kv: Arc<dyn KvStore>,
}

impl ParrotStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn is_started(&self, stream_id: StreamId) -> Result<bool, KvError> {
        self.kv.exists(&owner_key(stream_id))
    }

    /// Claim the stream for `repeater_id`. Returns false if already started.
    pub fn start_stream(&self, stream_id: StreamId, repeater_id: u32) -> Result<bool, KvError> {
        if self.kv.exists(&owner_key(stream_id))? {
            return Ok(false);
        }
        self.kv
            .set_ex(&owner_key(stream_id), repeater_id.to_string().as_bytes(), PARROT_TTL)?;
        Ok(true)
    }

    fn owner(&self, stream_id: StreamId) -> Result<u32, KvError> {
        let raw = self.kv.get(&owner_key(stream_id))?;
        let text = String::from_utf8(raw).map_err(|e| KvError::Decode(e.to_string()))?;
        text.parse::<u32>().map_err(|e| KvError::Decode(e.to_string()))
    }

    /// Append one burst to the stream log, already rewritten for the
    /// replay: destination repeater set to the owner, src and dst
    /// swapped, group flag and link quality bytes cleared.
    pub fn record_packet(&self, stream_id: StreamId, packet: &mut DmrdPacket) -> Result<(), KvError> {
        self.kv.expire(&owner_key(stream_id), PARROT_TTL)?;
        let owner = self.owner(stream_id)?;

        packet.repeater = owner;
        std::mem::swap(&mut packet.src, &mut packet.dst);
        packet.group_call = false;
        packet.ber = -1;
        packet.rssi = -1;

        self.kv.list_push(&packets_key(stream_id), &packet.encode(), PARROT_TTL)
    }

    /// Release the ownership key; the packet log stays until replayed
    /// or expired.
    pub fn stop_stream(&self, stream_id: StreamId) -> Result<(), KvError> {
        self.kv.delete(&owner_key(stream_id))?;
        self.kv.expire(&packets_key(stream_id), PARROT_TTL)?;
        Ok(())
    }

    /// Atomically take the recorded stream (snapshot-then-delete)
    pub fn get_stream(&self, stream_id: StreamId) -> Result<Vec<DmrdPacket>, KvError> {
        let items = self.kv.list_take(&packets_key(stream_id))?;
        let mut packets = Vec::with_capacity(items.len());
        for item in items {
            match DmrdPacket::parse(&item) {
                Ok(packet) => packets.push(packet),
                Err(e) => {
                    tracing::warn!("ParrotStore: bad recorded packet ({} bytes): {}", item.len(), e);
                }
            }
        }
        Ok(packets)
    }
}

/// Records inbound 9990 traffic and schedules the replay jobs
pub struct ParrotEngine {
    store: ParrotStore,
    sessions: SessionClient,
    tracker: Arc<CallTracker>,
    outgoing: Sender<(Vec<u8>, SocketAddr)>,
}

impl ParrotEngine {
    pub fn new(
        store: ParrotStore,
        sessions: SessionClient,
        tracker: Arc<CallTracker>,
        outgoing: Sender<(Vec<u8>, SocketAddr)>,
    ) -> Self {
        Self {
            store,
            sessions,
            tracker,
            outgoing,
        }
    }

    pub fn is_started(&self, stream_id: StreamId) -> bool {
        self.store.is_started(stream_id).unwrap_or(false)
    }

    pub fn start_stream(&self, stream_id: StreamId, repeater_id: u32) -> bool {
        match self.store.start_stream(stream_id, repeater_id) {
            Ok(started) => started,
            Err(e) => {
                tracing::error!("ParrotEngine: start stream {:08x} failed: {}", stream_id, e);
                false
            }
        }
    }

    pub fn record_packet(&self, stream_id: StreamId, packet: &mut DmrdPacket) {
        if let Err(e) = self.store.record_packet(stream_id, packet) {
            tracing::error!("ParrotEngine: record on stream {:08x} failed: {}", stream_id, e);
        }
    }

    /// Called on the stream's terminator: stop recording and spawn the
    /// replay thread.
    pub fn schedule_replay(self: &Arc<Self>, stream_id: StreamId) {
        if let Err(e) = self.store.stop_stream(stream_id) {
            tracing::error!("ParrotEngine: stop stream {:08x} failed: {}", stream_id, e);
        }

        let engine = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("parrot-replay-{:08x}", stream_id))
            .spawn(move || {
                thread::sleep(REPLAY_DELAY);
                engine.replay(stream_id);
            });
        if let Err(e) = spawned {
            tracing::error!("ParrotEngine: failed to spawn replay thread: {}", e);
        }
    }

    /// Pace the recorded stream back out at 60 ms per burst. A slow send
    /// shortens the following sleep (catch-up), it never bursts.
    fn replay(&self, stream_id: StreamId) {
        let packets = match self.store.get_stream(stream_id) {
            Ok(packets) => packets,
            Err(e) => {
                tracing::error!("ParrotEngine: fetch stream {:08x} failed: {}", stream_id, e);
                return;
            }
        };
        if packets.is_empty() {
            tracing::warn!("ParrotEngine: nothing recorded for stream {:08x}", stream_id);
            return;
        }

        // Every recorded packet was rewritten to the owner repeater
        let owner = packets[0].repeater;
        let addr = match self.sessions.get(owner) {
            Ok(session) => match session.addr() {
                Some(addr) => addr,
                None => {
                    tracing::error!("ParrotEngine: owner {} has unparseable endpoint", owner);
                    return;
                }
            },
            Err(e) => {
                tracing::warn!("ParrotEngine: owner {} session gone: {}", owner, e);
                return;
            }
        };

        tracing::info!(
            "ParrotEngine: replaying {} bursts of stream {:08x} to repeater {}",
            packets.len(),
            stream_id,
            owner
        );

        let last = packets.len() - 1;
        let mut started = Instant::now();
        for (i, packet) in packets.iter().enumerate() {
            if self.outgoing.send((packet.encode(), addr)).is_err() {
                tracing::warn!("ParrotEngine: outgoing queue closed, aborting replay");
                return;
            }

            if i == 0 && !self.tracker.is_call_active(packet) {
                self.tracker.start_call(packet);
            }
            self.tracker.process_call_packet(packet);
            if i == last {
                self.tracker.end_call(packet);
            }

            let elapsed = started.elapsed();
            if elapsed > FRAME_PACING {
                tracing::debug!(
                    "ParrotEngine: slow replay iteration ({:?}) on stream {:08x}",
                    elapsed,
                    stream_id
                );
                let overshoot = elapsed - FRAME_PACING;
                thread::sleep(FRAME_PACING.checked_sub(overshoot).unwrap_or_default());
            } else {
                thread::sleep(FRAME_PACING - elapsed);
            }
            started = Instant::now();
        }
    }
}
