use std::sync::Arc;

use serde::Deserialize;

/// Which backend serves the shared ephemeral state (sessions, parrot
/// streams, instance registry) and the raw-datagram bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum KvBackend {
    /// In-process map + bus. Single-instance deployments and tests.
    Memory,
    /// Shared Redis. Required for multi-replica operation.
    Redis,
}

/// Homebrew/MMDVM repeater protocol listener configuration
#[derive(Debug, Clone)]
pub struct CfgHbrp {
    /// Bind address for the repeater-facing UDP socket
    pub bind_host: String,
    /// UDP port, conventionally 62031
    pub bind_port: u16,
    /// Depth of the incoming-datagram channel. Overflow drops datagrams.
    pub incoming_queue: usize,
    /// Depth of the outgoing-datagram channel. Producers block when full.
    pub outgoing_queue: usize,
}

impl Default for CfgHbrp {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            bind_port: 62031,
            incoming_queue: 100,
            outgoing_queue: 100,
        }
    }
}

/// IPSC ingress configuration. Absent section disables the ingress.
#[derive(Debug, Clone)]
pub struct CfgIpsc {
    /// Bind address for the IPSC UDP socket
    pub bind_host: String,
    pub bind_port: u16,
    /// Our peer id, placed in every emitted IPSC packet
    pub peer_id: u32,
    /// 20-byte authentication key as hex; None disables the authenticated flavor
    pub auth_key: Option<Vec<u8>>,
    /// Translator streams idle longer than this are garbage collected
    pub stream_max_age_secs: u64,
}

/// Relational store configuration
#[derive(Debug, Clone)]
pub struct CfgDb {
    /// SQLite database path. ":memory:" is accepted.
    pub path: String,
}

impl Default for CfgDb {
    fn default() -> Self {
        Self { path: "brewhub.db".to_string() }
    }
}

/// Shared KV / bus configuration
#[derive(Debug, Clone)]
pub struct CfgKv {
    pub backend: KvBackend,
    /// Redis endpoint, e.g. "redis://127.0.0.1:6379". Required for Redis backend.
    pub redis_url: Option<String>,
}

impl Default for CfgKv {
    fn default() -> Self {
        Self {
            backend: KvBackend::Memory,
            redis_url: None,
        }
    }
}

/// Parrot loopback service configuration
#[derive(Debug, Clone)]
pub struct CfgParrot {
    pub enabled: bool,
}

impl Default for CfgParrot {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Complete stack configuration, assembled by toml_config
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub debug_log: Option<String>,
    pub hbrp: CfgHbrp,
    pub ipsc: Option<CfgIpsc>,
    pub db: CfgDb,
    pub kv: CfgKv,
    pub parrot: CfgParrot,
}

/// Cheaply cloneable handle on the loaded configuration
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<StackConfig>,
}

impl SharedConfig {
    pub fn from_parts(cfg: StackConfig) -> Self {
        Self { inner: Arc::new(cfg) }
    }

    pub fn config(&self) -> &StackConfig {
        &self.inner
    }
}
