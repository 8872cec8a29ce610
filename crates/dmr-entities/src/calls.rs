//! Per-stream call tracking: lifecycle, sequence-loss accounting, rolling
//! jitter, and the inactivity timeout that closes abandoned streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

use dmr_pdus::hbrp::{DmrdPacket, FrameType};

use crate::store::db::{Call, CallDest, Db};

/// A stream with no packets for this long is closed by the sweeper
pub const CALL_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(2);
/// Calls shorter than this are spurious key-ups and discarded
pub const MIN_CALL_DURATION_MS: i64 = 100;
/// Nominal burst spacing, the baseline of the jitter estimate
const EXPECTED_FRAME_MS: f32 = 60.0;

struct PendingTimeout {
    deadline: Instant,
    /// EndCall is invoked on the last packet's identity
    packet: DmrdPacket,
}

pub struct CallTracker {
    db: Db,
    timers: Mutex<HashMap<i64, PendingTimeout>>,
}

impl CallTracker {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            timers: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_dest(&self, packet: &DmrdPacket) -> CallDest {
        if packet.group_call {
            return CallDest::Talkgroup(packet.dst);
        }
        match self.db.repeater_exists(packet.dst) {
            Ok(true) => CallDest::Repeater(packet.dst),
            Ok(false) => CallDest::User(packet.dst),
            Err(e) => {
                tracing::error!("CallTracker: dest lookup failed: {}", e);
                CallDest::User(packet.dst)
            }
        }
    }

    /// DB predicate: an active row matching (streamID, src, dst, slot, groupCall)
    pub fn is_call_active(&self, packet: &DmrdPacket) -> bool {
        match self.db.find_active_call(
            packet.stream_id,
            packet.src,
            packet.dst,
            packet.slot,
            packet.group_call,
        ) {
            Ok(found) => found.is_some(),
            Err(e) => {
                tracing::error!("CallTracker: active-call lookup failed: {}", e);
                false
            }
        }
    }

    /// Open a call row for a stream's first burst. Unknown source users
    /// abort the call; their packets still route.
    pub fn start_call(&self, packet: &DmrdPacket) {
        let user = match self.db.get_user(packet.src) {
            Ok(Some(user)) => user,
            Ok(None) => {
                tracing::warn!("CallTracker: unknown source user {}, not tracking", packet.src);
                return;
            }
            Err(e) => {
                tracing::error!("CallTracker: user lookup failed: {}", e);
                return;
            }
        };

        let now = Utc::now();
        let mut call = Call {
            id: 0,
            stream_id: packet.stream_id,
            start_time: now,
            last_packet_time: now,
            duration_ms: 0,
            active: true,
            user_id: user.id,
            repeater_id: packet.repeater,
            slot: packet.slot,
            group_call: packet.group_call,
            dest: self.resolve_dest(packet),
            total_packets: 0,
            lost_sequences: 0,
            loss: 0.0,
            jitter: 0.0,
            last_frame_num: 5,
            has_header: false,
            has_term: false,
            ber: packet.ber,
            rssi: packet.rssi,
        };
        if let Err(e) = self.db.insert_call(&mut call) {
            tracing::error!("CallTracker: insert call failed: {}", e);
            return;
        }

        tracing::info!(
            "CallTracker: call started stream={:08x} {}->{} {} group={}",
            packet.stream_id,
            packet.src,
            packet.dst,
            packet.slot,
            packet.group_call
        );
        self.timers.lock().unwrap().insert(
            call.id,
            PendingTimeout {
                deadline: Instant::now() + CALL_INACTIVITY_TIMEOUT,
                packet: packet.clone(),
            },
        );
    }

    /// Account one in-stream burst: jitter, frame sequence loss,
    /// duration, and the refreshed inactivity deadline.
    pub fn process_call_packet(&self, packet: &DmrdPacket) {
        let mut call = match self.db.find_active_call(
            packet.stream_id,
            packet.src,
            packet.dst,
            packet.slot,
            packet.group_call,
        ) {
            Ok(Some(call)) => call,
            Ok(None) => {
                tracing::debug!("CallTracker: packet for untracked stream {:08x}", packet.stream_id);
                return;
            }
            Err(e) => {
                tracing::error!("CallTracker: active-call lookup failed: {}", e);
                return;
            }
        };

        self.timers.lock().unwrap().insert(
            call.id,
            PendingTimeout {
                deadline: Instant::now() + CALL_INACTIVITY_TIMEOUT,
                packet: packet.clone(),
            },
        );

        let now = Utc::now();
        let elapsed_ms = (now - call.last_packet_time).num_milliseconds() as f32;
        call.jitter = (call.jitter + (elapsed_ms - EXPECTED_FRAME_MS)) / 2.0;
        call.last_packet_time = now;

        account_frame(&mut call, packet);

        if packet.ber >= 0 {
            call.ber = packet.ber;
        }
        if packet.rssi >= 0 {
            call.rssi = packet.rssi;
        }

        call.duration_ms = (now - call.start_time).num_milliseconds();
        call.loss = compute_loss(&call);
        if let Err(e) = self.db.update_call(&call) {
            tracing::error!("CallTracker: update call failed: {}", e);
        }
    }

    /// Close the call matching this packet's identity (terminator seen,
    /// or the inactivity sweep firing with the last packet).
    pub fn end_call(&self, packet: &DmrdPacket) {
        let call = match self.db.find_active_call(
            packet.stream_id,
            packet.src,
            packet.dst,
            packet.slot,
            packet.group_call,
        ) {
            Ok(Some(call)) => call,
            Ok(None) => return,
            Err(e) => {
                tracing::error!("CallTracker: active-call lookup failed: {}", e);
                return;
            }
        };
        self.finish(call);
    }

    fn finish(&self, mut call: Call) {
        self.timers.lock().unwrap().remove(&call.id);

        let now = Utc::now();
        call.duration_ms = (now - call.start_time).num_milliseconds();

        if call.duration_ms < MIN_CALL_DURATION_MS {
            // Spurious key-up
            tracing::debug!("CallTracker: discarding {}ms key-up stream={:08x}", call.duration_ms, call.stream_id);
            if let Err(e) = self.db.delete_call(call.id) {
                tracing::error!("CallTracker: delete call failed: {}", e);
            }
            return;
        }

        if !call.has_term {
            call.lost_sequences += 1;
            call.total_packets += 1;
        }
        if call.last_frame_num != 5 {
            let missing = 5 - call.last_frame_num as u32;
            call.lost_sequences += missing;
            call.total_packets += missing;
        }

        call.active = false;
        call.loss = compute_loss(&call);
        tracing::info!(
            "CallTracker: call ended stream={:08x} duration={}ms packets={} lost={} loss={:.1}% jitter={:.1}ms",
            call.stream_id,
            call.duration_ms,
            call.total_packets,
            call.lost_sequences,
            call.loss * 100.0,
            call.jitter
        );
        if let Err(e) = self.db.update_call(&call) {
            tracing::error!("CallTracker: finalize call failed: {}", e);
        }
    }

    /// Close every call whose inactivity deadline has passed
    pub fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<DmrdPacket> = {
            let mut timers = self.timers.lock().unwrap();
            let ids: Vec<i64> = timers
                .iter()
                .filter(|(_, pending)| pending.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| timers.remove(id)).map(|p| p.packet).collect()
        };
        for packet in expired {
            tracing::debug!("CallTracker: inactivity timeout stream={:08x}", packet.stream_id);
            self.end_call(&packet);
        }
    }

    /// Number of armed inactivity timers (diagnostics, tests)
    pub fn pending_timeouts(&self) -> usize {
        self.timers.lock().unwrap().len()
    }

    pub fn spawn_sweeper(tracker: Arc<CallTracker>, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("call-sweeper".to_string())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(Duration::from_millis(100));
                while !stop.load(Ordering::SeqCst) {
                    if ticker.recv_timeout(Duration::from_millis(500)).is_ok() {
                        tracker.sweep();
                    }
                }
                tracing::debug!("CallTracker: sweeper stopped");
            })
            .expect("failed to spawn call-sweeper thread")
    }
}

fn compute_loss(call: &Call) -> f32 {
    if call.total_packets == 0 {
        return 0.0;
    }
    call.lost_sequences as f32 / call.total_packets as f32
}

/// The frame-sequence accounting of §voice streams: voice bursts carry a
/// sequence A..F (0..5), a sync resets it, header and terminator pin it
/// to 5. Gaps become lost sequences.
fn account_frame(call: &mut Call, packet: &DmrdPacket) {
    let vseq = packet.dtype_vseq as u32;
    let last = call.last_frame_num as u32;

    match packet.frame_type {
        FrameType::DataSync if packet.is_voice_head() => {
            call.has_header = true;
            call.total_packets += 1;
        }
        FrameType::DataSync if packet.is_voice_term() => {
            let lost = if last != 5 { 5 - last } else { 0 };
            call.has_term = true;
            call.last_frame_num = 5;
            call.lost_sequences += lost;
            call.total_packets += 1 + lost;
        }
        FrameType::DataSync => {
            // other data types are not part of the voice sequence
            call.total_packets += 1;
        }
        FrameType::VoiceSync if vseq == 0 => {
            if !call.has_header {
                tracing::debug!("CallTracker: late entry, no header seen stream={:08x}", call.stream_id);
            }
            let lost = if last != 5 { 5 - last } else { 0 };
            call.last_frame_num = 0;
            call.lost_sequences += lost;
            call.total_packets += 1 + lost;
        }
        FrameType::VoiceSync => {
            tracing::debug!("CallTracker: voice sync with vseq={} stream={:08x}", vseq, call.stream_id);
            call.total_packets += 1;
        }
        FrameType::Voice if (1..=4).contains(&vseq) => {
            let lost = if last == 5 {
                // lost the sync burst (and any frames before this one)
                if vseq == 1 { 1 } else { vseq - 1 }
            } else if last != vseq - 1 {
                (vseq as i64 - last as i64 - 1).max(0) as u32
            } else {
                0
            };
            call.last_frame_num = vseq as u8;
            call.lost_sequences += lost;
            call.total_packets += 1 + lost;
        }
        FrameType::Voice if vseq == 5 => {
            let lost = if last != 4 { (4i64 - last as i64).max(0) as u32 } else { 0 };
            call.last_frame_num = 5;
            call.lost_sequences += lost;
            call.total_packets += 1 + lost;
        }
        FrameType::Voice => {
            tracing::debug!("CallTracker: voice with bad vseq={} stream={:08x}", vseq, call.stream_id);
            call.total_packets += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmr_core::Timeslot;
    use dmr_pdus::hbrp::{DTYPE_VOICE_HEAD, DTYPE_VOICE_TERM};

    fn tracker() -> CallTracker {
        let db = Db::open(":memory:").unwrap();
        db.create_user(311860, "PD0TST").unwrap();
        db.create_talkgroup(3100, "Test").unwrap();
        CallTracker::new(db)
    }

    fn burst(frame_type: FrameType, dtype_vseq: u8) -> DmrdPacket {
        DmrdPacket {
            seq: 0,
            src: 311860,
            dst: 3100,
            repeater: 1001,
            slot: Timeslot::Ts1,
            group_call: true,
            frame_type,
            dtype_vseq,
            stream_id: 42,
            payload: [0u8; 33],
            ber: -1,
            rssi: -1,
        }
    }

    fn active_call(t: &CallTracker) -> Call {
        t.db.find_active_call(42, 311860, 3100, Timeslot::Ts1, true)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_start_creates_active_row() {
        let t = tracker();
        let head = burst(FrameType::DataSync, DTYPE_VOICE_HEAD);
        assert!(!t.is_call_active(&head));
        t.start_call(&head);
        assert!(t.is_call_active(&head));
        let call = active_call(&t);
        assert_eq!(call.last_frame_num, 5);
        assert_eq!(call.total_packets, 0);
        assert!(!call.has_header);
        assert_eq!(t.pending_timeouts(), 1);
    }

    #[test]
    fn test_unknown_user_not_tracked() {
        let t = tracker();
        let mut head = burst(FrameType::DataSync, DTYPE_VOICE_HEAD);
        head.src = 12345;
        t.start_call(&head);
        assert!(!t.is_call_active(&head));
    }

    #[test]
    fn test_clean_superframe_has_no_loss() {
        let t = tracker();
        let head = burst(FrameType::DataSync, DTYPE_VOICE_HEAD);
        t.start_call(&head);
        t.process_call_packet(&head);
        t.process_call_packet(&burst(FrameType::VoiceSync, 0));
        for vseq in 1..=5 {
            t.process_call_packet(&burst(FrameType::Voice, vseq));
        }
        let call = active_call(&t);
        assert_eq!(call.total_packets, 7);
        assert_eq!(call.lost_sequences, 0);
        assert!(call.has_header);
        assert_eq!(call.last_frame_num, 5);
    }

    #[test]
    fn test_gap_counts_lost_frames() {
        let t = tracker();
        let head = burst(FrameType::DataSync, DTYPE_VOICE_HEAD);
        t.start_call(&head);
        t.process_call_packet(&head);
        t.process_call_packet(&burst(FrameType::VoiceSync, 0));
        t.process_call_packet(&burst(FrameType::Voice, 1));
        // frames 2 and 3 dropped
        t.process_call_packet(&burst(FrameType::Voice, 4));
        let call = active_call(&t);
        assert_eq!(call.lost_sequences, 2);
        // head + sync + v1 + v4 delivered, plus 2 counted as lost
        assert_eq!(call.total_packets, 6);
    }

    #[test]
    fn test_lost_sync_special_case() {
        let t = tracker();
        let head = burst(FrameType::DataSync, DTYPE_VOICE_HEAD);
        t.start_call(&head);
        t.process_call_packet(&head);
        // sync (vseq 0) dropped; first voice burst arrives at vseq 1
        t.process_call_packet(&burst(FrameType::Voice, 1));
        let call = active_call(&t);
        assert_eq!(call.lost_sequences, 1);
        assert_eq!(call.last_frame_num, 1);
    }

    #[test]
    fn test_terminator_closes_call() {
        let t = tracker();
        let head = burst(FrameType::DataSync, DTYPE_VOICE_HEAD);
        t.start_call(&head);
        t.process_call_packet(&head);
        t.process_call_packet(&burst(FrameType::VoiceSync, 0));
        for vseq in 1..=5 {
            t.process_call_packet(&burst(FrameType::Voice, vseq));
        }
        std::thread::sleep(Duration::from_millis(120));
        let term = burst(FrameType::DataSync, DTYPE_VOICE_TERM);
        t.process_call_packet(&term);
        t.end_call(&term);

        assert!(!t.is_call_active(&term));
        let call = t.db.get_call(1).unwrap().unwrap();
        assert!(!call.active);
        assert!(call.has_term);
        assert_eq!(call.lost_sequences, 0);
        assert_eq!(call.total_packets, 8);
        assert!(call.duration_ms >= 100);
        assert_eq!(t.pending_timeouts(), 0);
    }

    #[test]
    fn test_spurious_keyup_discarded() {
        let t = tracker();
        let head = burst(FrameType::DataSync, DTYPE_VOICE_HEAD);
        t.start_call(&head);
        t.process_call_packet(&head);
        // terminator immediately: duration under the 100 ms floor
        t.end_call(&head);
        assert!(t.db.get_call(1).unwrap().is_none());
    }

    #[test]
    fn test_inactivity_accounting() {
        let t = tracker();
        let head = burst(FrameType::DataSync, DTYPE_VOICE_HEAD);
        t.start_call(&head);
        t.process_call_packet(&head);
        t.process_call_packet(&burst(FrameType::VoiceSync, 0));
        t.process_call_packet(&burst(FrameType::Voice, 1));
        t.process_call_packet(&burst(FrameType::Voice, 2));
        std::thread::sleep(Duration::from_millis(120));

        // inactivity fires EndCall with the last packet's identity
        t.end_call(&burst(FrameType::Voice, 2));
        let call = t.db.get_call(1).unwrap().unwrap();
        assert!(!call.active);
        assert!(!call.has_term);
        // +1 for the missing terminator, +3 for frames 3..5
        assert_eq!(call.lost_sequences, 4);
        assert_eq!(call.total_packets, 8);
        assert!(call.loss > 0.0 && call.loss <= 1.0);
    }

    #[test]
    fn test_sweep_closes_expired() {
        let t = tracker();
        let head = burst(FrameType::DataSync, DTYPE_VOICE_HEAD);
        t.start_call(&head);
        t.process_call_packet(&head);
        std::thread::sleep(Duration::from_millis(120));
        // force the deadline into the past
        {
            let mut timers = t.timers.lock().unwrap();
            for pending in timers.values_mut() {
                pending.deadline = Instant::now() - Duration::from_millis(1);
            }
        }
        t.sweep();
        assert!(!t.is_call_active(&head));
    }

    #[test]
    fn test_loss_monotonic_within_call() {
        let t = tracker();
        let head = burst(FrameType::DataSync, DTYPE_VOICE_HEAD);
        t.start_call(&head);
        t.process_call_packet(&head);
        t.process_call_packet(&burst(FrameType::VoiceSync, 0));
        let mut prev_lost = 0;
        for vseq in [2u8, 4, 5] {
            t.process_call_packet(&burst(FrameType::Voice, vseq));
            let call = active_call(&t);
            assert!(call.lost_sequences >= prev_lost);
            assert!(call.total_packets >= call.lost_sequences);
            prev_lost = call.lost_sequences;
        }
    }
}
