//! Live repeater sessions in the shared KV: the handshake state machine
//! record and its typed client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use dmr_pdus::hbrp::RptcFrame;

use crate::store::{KvError, KvStore};

/// Sessions expire five minutes after the last packet from that id
pub const SESSION_TTL: Duration = Duration::from_secs(300);

const KEY_PREFIX: &str = "hbrp:repeater:";

/// Handshake progression. Only `Connected` sessions may originate
/// data-plane packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    LoginReceived,
    ChallengeSent,
    WaitingConfig,
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoginReceived => write!(f, "LOGIN_RECEIVED"),
            Self::ChallengeSent => write!(f, "CHALLENGE_SENT"),
            Self::WaitingConfig => write!(f, "WAITING_CONFIG"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// The repeater configuration mirrored into the session after RPTC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
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
}

impl From<&RptcFrame> for SessionConfig {
    fn from(frame: &RptcFrame) -> Self {
        SessionConfig {
            callsign: frame.callsign.clone(),
            rx_freq: frame.rx_freq,
            tx_freq: frame.tx_freq,
            tx_power: frame.tx_power,
            color_code: frame.color_code,
            latitude: frame.latitude,
            longitude: frame.longitude,
            height: frame.height,
            location: frame.location.clone(),
            description: frame.description.clone(),
            slots: frame.slots,
            url: frame.url.clone(),
            software_id: frame.software_id.clone(),
            package_id: frame.package_id.clone(),
        }
    }
}

/// One live session, keyed `hbrp:repeater:{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeaterSession {
    pub id: u32,
    pub ip: String,
    pub port: u16,
    pub connection: ConnectionState,
    pub salt: u32,
    pub last_ping_ms: i64,
    pub connected_at_ms: i64,
    pub pings_received: u32,
    pub config: Option<SessionConfig>,
}

impl RepeaterSession {
    pub fn new(id: u32, addr: SocketAddr, salt: u32) -> Self {
        RepeaterSession {
            id,
            ip: addr.ip().to_string(),
            port: addr.port(),
            connection: ConnectionState::LoginReceived,
            salt,
            last_ping_ms: 0,
            connected_at_ms: 0,
            pings_received: 0,
            config: None,
        }
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.ip, self.port).parse().ok()
    }
}

/// Typed client over the KV for session records (best-effort state;
/// durable truth lives in the database)
#[derive(Clone)]
pub struct SessionClient {
    kv: Arc<dyn KvStore>,
}

impl SessionClient {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(id: u32) -> String {
        format!("{}{}", KEY_PREFIX, id)
    }

    /// Serialize and write the session, resetting its TTL
    pub fn store(&self, session: &RepeaterSession) -> Result<(), KvError> {
        let packed = rmp_serde::to_vec(session).map_err(|e| KvError::Decode(e.to_string()))?;
        self.kv.set_ex(&Self::key(session.id), &packed, SESSION_TTL)
    }

    pub fn get(&self, id: u32) -> Result<RepeaterSession, KvError> {
        let packed = self.kv.get(&Self::key(id))?;
        rmp_serde::from_slice(&packed).map_err(|e| KvError::Decode(e.to_string()))
    }

    pub fn exists(&self, id: u32) -> Result<bool, KvError> {
        self.kv.exists(&Self::key(id))
    }

    /// Refresh the session on a keep-alive: last ping time, ping count,
    /// and the source endpoint (permits pod handoff after a rolling
    /// deployment). Resets the TTL.
    pub fn update_ping(&self, id: u32, addr: SocketAddr, now_ms: i64) -> Result<(), KvError> {
        let mut session = self.get(id)?;
        session.last_ping_ms = now_ms;
        session.pings_received += 1;
        session.ip = addr.ip().to_string();
        session.port = addr.port();
        self.store(&session)
    }

    /// Refresh only the TTL, as every packet from a live id must
    pub fn touch(&self, id: u32) -> Result<bool, KvError> {
        self.kv.expire(&Self::key(id), SESSION_TTL)
    }

    pub fn update_connection(&self, id: u32, state: ConnectionState) -> Result<(), KvError> {
        let mut session = self.get(id)?;
        session.connection = state;
        self.store(&session)
    }

    pub fn delete(&self, id: u32) -> Result<bool, KvError> {
        self.kv.delete(&Self::key(id))
    }

    /// All live session ids (prefix scan, numeric suffix parse).
    /// Keys with a non-numeric suffix are skipped.
    pub fn list(&self) -> Result<Vec<u32>, KvError> {
        let keys = self.kv.scan_prefix(KEY_PREFIX)?;
        Ok(keys
            .iter()
            .filter_map(|key| key[KEY_PREFIX.len()..].parse::<u32>().ok())
            .collect())
    }
}
