//! Relational store: repeaters (with their static/dynamic talkgroup
//! subscriptions), users, talkgroups and per-stream call records.
//!
//! SQLite behind a mutexed connection. Per-entity writes are
//! single-writer by convention (the instance serving that repeater), so
//! one connection per process is sufficient.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use dmr_core::Timeslot;
use dmr_pdus::hbrp::RptcFrame;
use rusqlite::{Connection, OptionalExtension, params};

#[derive(Debug)]
pub struct DbError(rusqlite::Error);

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "db: {}", self.0)
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(e: rusqlite::Error) -> Self {
        DbError(e)
    }
}

pub type DbResult<T> = Result<T, DbError>;

// ─── Models ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: u32,
    pub callsign: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Repeater {
    pub id: u32,
    pub owner_id: Option<u32>,
    pub password: String,
    pub callsign: String,
    pub rx_freq: u32,
    pub tx_freq: u32,
    pub tx_power: u8,
    pub color_code: u8,
    pub latitude: f32,
    pub longitude: f32,
    pub height: u16,
    pub location: String,
    pub description: String,
    pub slots: u8,
    pub url: String,
    pub software_id: String,
    pub package_id: String,
    pub ts1_dynamic: Option<u32>,
    pub ts2_dynamic: Option<u32>,
    pub last_ping: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
}

/// Talkgroup subscriptions of one repeater, loaded per routing decision
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subscriptions {
    pub ts1_static: Vec<u32>,
    pub ts2_static: Vec<u32>,
    pub ts1_dynamic: Option<u32>,
    pub ts2_dynamic: Option<u32>,
}

impl Subscriptions {
    /// Whether this repeater wants a group packet for `dst`, and on which
    /// slot. Slot 1 is preferred when both match.
    pub fn wants(&self, dst: u32) -> Option<Timeslot> {
        if self.ts1_static.contains(&dst) || self.ts1_dynamic == Some(dst) {
            return Some(Timeslot::Ts1);
        }
        if self.ts2_static.contains(&dst) || self.ts2_dynamic == Some(dst) {
            return Some(Timeslot::Ts2);
        }
        None
    }
}

/// The single destination of a call, tagged at StartCall time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDest {
    Talkgroup(u32),
    User(u32),
    Repeater(u32),
}

impl CallDest {
    pub fn id(&self) -> u32 {
        match self {
            CallDest::Talkgroup(id) | CallDest::User(id) | CallDest::Repeater(id) => *id,
        }
    }
}

/// Durable per-stream record with loss/jitter accounting
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub id: i64,
    pub stream_id: u32,
    pub start_time: DateTime<Utc>,
    pub last_packet_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub active: bool,
    pub user_id: u32,
    pub repeater_id: u32,
    pub slot: Timeslot,
    pub group_call: bool,
    pub dest: CallDest,
    pub total_packets: u32,
    pub lost_sequences: u32,
    pub loss: f32,
    pub jitter: f32,
    pub last_frame_num: u8,
    pub has_header: bool,
    pub has_term: bool,
    pub ber: i16,
    pub rssi: i16,
}

// ─── Handle ───────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    callsign TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS talkgroups (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS repeaters (
    id INTEGER PRIMARY KEY,
    owner_id INTEGER REFERENCES users(id),
    password TEXT NOT NULL,
    callsign TEXT NOT NULL DEFAULT '',
    rx_freq INTEGER NOT NULL DEFAULT 0,
    tx_freq INTEGER NOT NULL DEFAULT 0,
    tx_power INTEGER NOT NULL DEFAULT 0,
    color_code INTEGER NOT NULL DEFAULT 1,
    latitude REAL NOT NULL DEFAULT 0,
    longitude REAL NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0,
    location TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    slots INTEGER NOT NULL DEFAULT 2,
    url TEXT NOT NULL DEFAULT '',
    software_id TEXT NOT NULL DEFAULT '',
    package_id TEXT NOT NULL DEFAULT '',
    ts1_dynamic INTEGER REFERENCES talkgroups(id),
    ts2_dynamic INTEGER REFERENCES talkgroups(id),
    last_ping_ms INTEGER,
    connected_at_ms INTEGER
);

CREATE TABLE IF NOT EXISTS repeater_ts1_static (
    repeater_id INTEGER NOT NULL REFERENCES repeaters(id),
    talkgroup_id INTEGER NOT NULL REFERENCES talkgroups(id),
    PRIMARY KEY (repeater_id, talkgroup_id)
);

CREATE TABLE IF NOT EXISTS repeater_ts2_static (
    repeater_id INTEGER NOT NULL REFERENCES repeaters(id),
    talkgroup_id INTEGER NOT NULL REFERENCES talkgroups(id),
    PRIMARY KEY (repeater_id, talkgroup_id)
);

CREATE TABLE IF NOT EXISTS calls (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    stream_id INTEGER NOT NULL,
    start_time_ms INTEGER NOT NULL,
    last_packet_time_ms INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 1,
    user_id INTEGER NOT NULL,
    repeater_id INTEGER NOT NULL,
    slot INTEGER NOT NULL,
    group_call INTEGER NOT NULL,
    is_to_talkgroup INTEGER NOT NULL DEFAULT 0,
    is_to_user INTEGER NOT NULL DEFAULT 0,
    is_to_repeater INTEGER NOT NULL DEFAULT 0,
    to_talkgroup_id INTEGER,
    to_user_id INTEGER,
    to_repeater_id INTEGER,
    total_packets INTEGER NOT NULL DEFAULT 0,
    lost_sequences INTEGER NOT NULL DEFAULT 0,
    loss REAL NOT NULL DEFAULT 0,
    jitter REAL NOT NULL DEFAULT 0,
    last_frame_num INTEGER NOT NULL DEFAULT 5,
    has_header INTEGER NOT NULL DEFAULT 0,
    has_term INTEGER NOT NULL DEFAULT 0,
    ber INTEGER NOT NULL DEFAULT -1,
    rssi INTEGER NOT NULL DEFAULT -1
);

CREATE INDEX IF NOT EXISTS idx_calls_active ON calls (active, stream_id);
"#;

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

impl Db {
    /// Open (or create) the database and apply the schema.
    /// Startup-only fatality: callers exit on failure.
    pub fn open(path: &str) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Db { conn: Arc::new(Mutex::new(conn)) })
    }

    // ─── Users and talkgroups ─────────────────────────────────────

    pub fn create_user(&self, id: u32, callsign: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO users (id, callsign) VALUES (?1, ?2)",
            params![id, callsign],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: u32) -> DbResult<Option<User>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, callsign FROM users WHERE id = ?1",
            params![id],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    callsign: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(DbError::from)
    }

    pub fn create_talkgroup(&self, id: u32, name: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO talkgroups (id, name) VALUES (?1, ?2)",
            params![id, name],
        )?;
        Ok(())
    }

    pub fn talkgroup_exists(&self, id: u32) -> DbResult<bool> {
        let conn = self.conn.lock().unwrap();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM talkgroups WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ─── Repeaters ────────────────────────────────────────────────

    /// Register a hotspot id with its shared secret. The remaining
    /// columns are filled in by the RPTC frame on connect.
    pub fn create_repeater(&self, id: u32, owner_id: Option<u32>, password: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO repeaters (id, owner_id, password) VALUES (?1, ?2, ?3)",
            params![id, owner_id, password],
        )?;
        Ok(())
    }

    pub fn repeater_exists(&self, id: u32) -> DbResult<bool> {
        let conn = self.conn.lock().unwrap();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM repeaters WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn repeater_password(&self, id: u32) -> DbResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT password FROM repeaters WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(DbError::from)
    }

    pub fn get_repeater(&self, id: u32) -> DbResult<Option<Repeater>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, owner_id, password, callsign, rx_freq, tx_freq, tx_power, color_code,
                    latitude, longitude, height, location, description, slots, url,
                    software_id, package_id, ts1_dynamic, ts2_dynamic, last_ping_ms, connected_at_ms
             FROM repeaters WHERE id = ?1",
            params![id],
            |row| {
                Ok(Repeater {
                    id: row.get(0)?,
                    owner_id: row.get(1)?,
                    password: row.get(2)?,
                    callsign: row.get(3)?,
                    rx_freq: row.get(4)?,
                    tx_freq: row.get(5)?,
                    tx_power: row.get(6)?,
                    color_code: row.get(7)?,
                    latitude: row.get(8)?,
                    longitude: row.get(9)?,
                    height: row.get(10)?,
                    location: row.get(11)?,
                    description: row.get(12)?,
                    slots: row.get(13)?,
                    url: row.get(14)?,
                    software_id: row.get(15)?,
                    package_id: row.get(16)?,
                    ts1_dynamic: row.get(17)?,
                    ts2_dynamic: row.get(18)?,
                    last_ping: row.get::<_, Option<i64>>(19)?.map(ms_to_dt),
                    connected_at: row.get::<_, Option<i64>>(20)?.map(ms_to_dt),
                })
            },
        )
        .optional()
        .map_err(DbError::from)
    }

    /// Mirror a parsed RPTC frame into the durable row
    pub fn update_repeater_config(&self, id: u32, frame: &RptcFrame) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE repeaters SET callsign = ?2, rx_freq = ?3, tx_freq = ?4, tx_power = ?5,
                    color_code = ?6, latitude = ?7, longitude = ?8, height = ?9, location = ?10,
                    description = ?11, slots = ?12, url = ?13, software_id = ?14, package_id = ?15
             WHERE id = ?1",
            params![
                id,
                frame.callsign,
                frame.rx_freq,
                frame.tx_freq,
                frame.tx_power,
                frame.color_code,
                frame.latitude,
                frame.longitude,
                frame.height,
                frame.location,
                frame.description,
                frame.slots,
                frame.url,
                frame.software_id,
                frame.package_id,
            ],
        )?;
        Ok(())
    }

    pub fn touch_last_ping(&self, id: u32, at: DateTime<Utc>) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE repeaters SET last_ping_ms = ?2 WHERE id = ?1",
            params![id, dt_to_ms(at)],
        )?;
        Ok(())
    }

    pub fn mark_connected(&self, id: u32, at: DateTime<Utc>) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE repeaters SET connected_at_ms = ?2, last_ping_ms = ?2 WHERE id = ?1",
            params![id, dt_to_ms(at)],
        )?;
        Ok(())
    }

    // ─── Talkgroup subscriptions ──────────────────────────────────

    pub fn add_static(&self, id: u32, slot: Timeslot, talkgroup: u32) -> DbResult<()> {
        let table = match slot {
            Timeslot::Ts1 => "repeater_ts1_static",
            Timeslot::Ts2 => "repeater_ts2_static",
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!("INSERT OR IGNORE INTO {} (repeater_id, talkgroup_id) VALUES (?1, ?2)", table),
            params![id, talkgroup],
        )?;
        Ok(())
    }

    pub fn set_dynamic(&self, id: u32, slot: Timeslot, talkgroup: Option<u32>) -> DbResult<()> {
        let column = match slot {
            Timeslot::Ts1 => "ts1_dynamic",
            Timeslot::Ts2 => "ts2_dynamic",
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!("UPDATE repeaters SET {} = ?2 WHERE id = ?1", column),
            params![id, talkgroup],
        )?;
        Ok(())
    }

    pub fn subscriptions(&self, id: u32) -> DbResult<Subscriptions> {
        let conn = self.conn.lock().unwrap();
        let (ts1_dynamic, ts2_dynamic): (Option<u32>, Option<u32>) = conn.query_row(
            "SELECT ts1_dynamic, ts2_dynamic FROM repeaters WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut subs = Subscriptions {
            ts1_dynamic,
            ts2_dynamic,
            ..Default::default()
        };
        for (table, out) in [
            ("repeater_ts1_static", &mut subs.ts1_static),
            ("repeater_ts2_static", &mut subs.ts2_static),
        ] {
            let mut stmt = conn.prepare(&format!(
                "SELECT talkgroup_id FROM {} WHERE repeater_id = ?1",
                table
            ))?;
            let rows = stmt.query_map(params![id], |row| row.get::<_, u32>(0))?;
            for tg in rows {
                out.push(tg?);
            }
        }
        Ok(subs)
    }

    // ─── Calls ────────────────────────────────────────────────────

    pub fn insert_call(&self, call: &mut Call) -> DbResult<()> {
        let (to_tg, to_user, to_rpt) = dest_columns(call.dest);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO calls (stream_id, start_time_ms, last_packet_time_ms, duration_ms, active,
                    user_id, repeater_id, slot, group_call,
                    is_to_talkgroup, is_to_user, is_to_repeater,
                    to_talkgroup_id, to_user_id, to_repeater_id,
                    total_packets, lost_sequences, loss, jitter,
                    last_frame_num, has_header, has_term, ber, rssi)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                     ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
            params![
                call.stream_id,
                dt_to_ms(call.start_time),
                dt_to_ms(call.last_packet_time),
                call.duration_ms,
                call.active,
                call.user_id,
                call.repeater_id,
                call.slot.as_bit(),
                call.group_call,
                to_tg.is_some(),
                to_user.is_some(),
                to_rpt.is_some(),
                to_tg,
                to_user,
                to_rpt,
                call.total_packets,
                call.lost_sequences,
                call.loss,
                call.jitter,
                call.last_frame_num,
                call.has_header,
                call.has_term,
                call.ber,
                call.rssi,
            ],
        )?;
        call.id = conn.last_insert_rowid();
        Ok(())
    }

    /// The IsCallActive predicate: an active row matching the stream
    /// identity (streamID, src user, dst, slot, groupCall)
    pub fn find_active_call(
        &self,
        stream_id: u32,
        user_id: u32,
        dest_id: u32,
        slot: Timeslot,
        group_call: bool,
    ) -> DbResult<Option<Call>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT {} FROM calls
                 WHERE active = 1 AND stream_id = ?1 AND user_id = ?2 AND slot = ?3
                   AND group_call = ?4
                   AND COALESCE(to_talkgroup_id, to_user_id, to_repeater_id) = ?5",
                CALL_COLUMNS
            ),
            params![stream_id, user_id, slot.as_bit(), group_call, dest_id],
            row_to_call,
        )
        .optional()
        .map_err(DbError::from)
    }

    pub fn get_call(&self, id: i64) -> DbResult<Option<Call>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {} FROM calls WHERE id = ?1", CALL_COLUMNS),
            params![id],
            row_to_call,
        )
        .optional()
        .map_err(DbError::from)
    }

    pub fn update_call(&self, call: &Call) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE calls SET last_packet_time_ms = ?2, duration_ms = ?3, active = ?4,
                    total_packets = ?5, lost_sequences = ?6, loss = ?7, jitter = ?8,
                    last_frame_num = ?9, has_header = ?10, has_term = ?11, ber = ?12, rssi = ?13
             WHERE id = ?1",
            params![
                call.id,
                dt_to_ms(call.last_packet_time),
                call.duration_ms,
                call.active,
                call.total_packets,
                call.lost_sequences,
                call.loss,
                call.jitter,
                call.last_frame_num,
                call.has_header,
                call.has_term,
                call.ber,
                call.rssi,
            ],
        )?;
        Ok(())
    }

    pub fn delete_call(&self, id: i64) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM calls WHERE id = ?1", params![id])?;
        Ok(())
    }
}

const CALL_COLUMNS: &str = "id, stream_id, start_time_ms, last_packet_time_ms, duration_ms, active,
    user_id, repeater_id, slot, group_call,
    to_talkgroup_id, to_user_id, to_repeater_id,
    total_packets, lost_sequences, loss, jitter, last_frame_num, has_header, has_term, ber, rssi";

fn dest_columns(dest: CallDest) -> (Option<u32>, Option<u32>, Option<u32>) {
    match dest {
        CallDest::Talkgroup(id) => (Some(id), None, None),
        CallDest::User(id) => (None, Some(id), None),
        CallDest::Repeater(id) => (None, None, Some(id)),
    }
}

fn row_to_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<Call> {
    let to_tg: Option<u32> = row.get(10)?;
    let to_user: Option<u32> = row.get(11)?;
    let to_rpt: Option<u32> = row.get(12)?;
    let dest = if let Some(id) = to_tg {
        CallDest::Talkgroup(id)
    } else if let Some(id) = to_user {
        CallDest::User(id)
    } else {
        CallDest::Repeater(to_rpt.unwrap_or(0))
    };

    Ok(Call {
        id: row.get(0)?,
        stream_id: row.get(1)?,
        start_time: ms_to_dt(row.get(2)?),
        last_packet_time: ms_to_dt(row.get(3)?),
        duration_ms: row.get(4)?,
        active: row.get(5)?,
        user_id: row.get(6)?,
        repeater_id: row.get(7)?,
        slot: Timeslot::from_bit(row.get(8)?),
        group_call: row.get(9)?,
        dest,
        total_packets: row.get(13)?,
        lost_sequences: row.get(14)?,
        loss: row.get(15)?,
        jitter: row.get(16)?,
        last_frame_num: row.get(17)?,
        has_header: row.get(18)?,
        has_term: row.get(19)?,
        ber: row.get(20)?,
        rssi: row.get(21)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Db {
        Db::open(":memory:").unwrap()
    }

    #[test]
    fn test_repeater_lifecycle() {
        let db = test_db();
        db.create_repeater(311860, None, "s3cr37w0rd").unwrap();
        assert!(db.repeater_exists(311860).unwrap());
        assert!(!db.repeater_exists(999999).unwrap());
        assert_eq!(db.repeater_password(311860).unwrap().unwrap(), "s3cr37w0rd");

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
            software_id: "MMDVM".into(),
            package_id: "".into(),
        };
        db.update_repeater_config(311860, &frame).unwrap();
        let rpt = db.get_repeater(311860).unwrap().unwrap();
        assert_eq!(rpt.callsign, "PD0TST");
        assert_eq!(rpt.rx_freq, 438_800_000);
        assert!(rpt.connected_at.is_none());

        let now = Utc::now();
        db.mark_connected(311860, now).unwrap();
        let rpt = db.get_repeater(311860).unwrap().unwrap();
        assert!(rpt.connected_at.is_some());
    }

    #[test]
    fn test_subscriptions_and_wants() {
        let db = test_db();
        db.create_repeater(1001, None, "pw").unwrap();
        db.create_talkgroup(3100, "Nationwide").unwrap();
        db.create_talkgroup(3112, "Regional").unwrap();
        db.add_static(1001, Timeslot::Ts1, 3100).unwrap();
        db.set_dynamic(1001, Timeslot::Ts2, Some(3112)).unwrap();

        let subs = db.subscriptions(1001).unwrap();
        assert_eq!(subs.ts1_static, vec![3100]);
        assert_eq!(subs.ts2_dynamic, Some(3112));

        assert_eq!(subs.wants(3100), Some(Timeslot::Ts1));
        assert_eq!(subs.wants(3112), Some(Timeslot::Ts2));
        assert_eq!(subs.wants(9), None);

        // clearing the dynamic drops the subscription
        db.set_dynamic(1001, Timeslot::Ts2, None).unwrap();
        assert_eq!(db.subscriptions(1001).unwrap().wants(3112), None);
    }

    #[test]
    fn test_slot1_preferred_when_both_match() {
        let subs = Subscriptions {
            ts1_static: vec![3100],
            ts2_static: vec![3100],
            ..Default::default()
        };
        assert_eq!(subs.wants(3100), Some(Timeslot::Ts1));
    }

    #[test]
    fn test_call_round_trip() {
        let db = test_db();
        let now = Utc::now();
        let mut call = Call {
            id: 0,
            stream_id: 42,
            start_time: now,
            last_packet_time: now,
            duration_ms: 0,
            active: true,
            user_id: 311860,
            repeater_id: 1001,
            slot: Timeslot::Ts1,
            group_call: true,
            dest: CallDest::Talkgroup(3100),
            total_packets: 0,
            lost_sequences: 0,
            loss: 0.0,
            jitter: 0.0,
            last_frame_num: 5,
            has_header: false,
            has_term: false,
            ber: -1,
            rssi: -1,
        };
        db.insert_call(&mut call).unwrap();
        assert!(call.id > 0);

        let found = db
            .find_active_call(42, 311860, 3100, Timeslot::Ts1, true)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, call.id);
        assert_eq!(found.dest, CallDest::Talkgroup(3100));

        // different slot: no match
        assert!(db.find_active_call(42, 311860, 3100, Timeslot::Ts2, true).unwrap().is_none());

        call.total_packets = 12;
        call.lost_sequences = 1;
        call.active = false;
        db.update_call(&call).unwrap();
        assert!(db.find_active_call(42, 311860, 3100, Timeslot::Ts1, true).unwrap().is_none());
        let stored = db.get_call(call.id).unwrap().unwrap();
        assert_eq!(stored.total_packets, 12);
        assert!(!stored.active);
    }

    #[test]
    fn test_call_delete() {
        let db = test_db();
        let now = Utc::now();
        let mut call = Call {
            id: 0,
            stream_id: 7,
            start_time: now,
            last_packet_time: now,
            duration_ms: 50,
            active: true,
            user_id: 1,
            repeater_id: 2,
            slot: Timeslot::Ts2,
            group_call: false,
            dest: CallDest::User(3),
            total_packets: 1,
            lost_sequences: 0,
            loss: 0.0,
            jitter: 0.0,
            last_frame_num: 5,
            has_header: false,
            has_term: false,
            ber: -1,
            rssi: -1,
        };
        db.insert_call(&mut call).unwrap();
        db.delete_call(call.id).unwrap();
        assert!(db.get_call(call.id).unwrap().is_none());
    }
}
