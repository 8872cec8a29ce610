use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::Deserialize;
use toml::Value;

use super::stack_config::{
    CfgDb, CfgHbrp, CfgIpsc, CfgKv, CfgParrot, KvBackend, SharedConfig, StackConfig,
};

/// Build `SharedConfig` from a TOML configuration file
pub fn from_toml_str(toml_str: &str) -> Result<SharedConfig, Box<dyn std::error::Error>> {
    let root: TomlConfigRoot = toml::from_str(toml_str)?;

    // Various sanity checks
    let expected_config_version = "0.3";
    if !root.config_version.eq(expected_config_version) {
        return Err(format!(
            "Unrecognized config_version: {}, expect {}",
            root.config_version, expected_config_version
        )
        .into());
    }
    if !root.extra.is_empty() {
        return Err(format!("Unrecognized top-level fields: {:?}", sorted_keys(&root.extra)).into());
    }
    if let Some(ref hbrp) = root.hbrp {
        if !hbrp.extra.is_empty() {
            return Err(format!("Unrecognized fields: hbrp::{:?}", sorted_keys(&hbrp.extra)).into());
        }
    }
    if let Some(ref ipsc) = root.ipsc {
        if !ipsc.extra.is_empty() {
            return Err(format!("Unrecognized fields: ipsc::{:?}", sorted_keys(&ipsc.extra)).into());
        }
    }
    if let Some(ref db) = root.db {
        if !db.extra.is_empty() {
            return Err(format!("Unrecognized fields: db::{:?}", sorted_keys(&db.extra)).into());
        }
    }
    if let Some(ref kv) = root.kv {
        if !kv.extra.is_empty() {
            return Err(format!("Unrecognized fields: kv::{:?}", sorted_keys(&kv.extra)).into());
        }
    }
    if let Some(ref parrot) = root.parrot {
        if !parrot.extra.is_empty() {
            return Err(format!("Unrecognized fields: parrot::{:?}", sorted_keys(&parrot.extra)).into());
        }
    }

    // Build config from required and optional values
    let mut cfg = StackConfig {
        debug_log: root.debug_log,
        hbrp: CfgHbrp::default(),
        ipsc: None,
        db: CfgDb::default(),
        kv: CfgKv::default(),
        parrot: CfgParrot::default(),
    };

    if let Some(hbrp) = root.hbrp {
        apply_hbrp_patch(&mut cfg.hbrp, hbrp);
    }
    if let Some(ipsc) = root.ipsc {
        cfg.ipsc = Some(apply_ipsc_patch(ipsc)?);
    }
    if let Some(db) = root.db {
        if let Some(path) = db.path {
            cfg.db.path = path;
        }
    }
    if let Some(kv) = root.kv {
        apply_kv_patch(&mut cfg.kv, kv)?;
    }
    if let Some(parrot) = root.parrot {
        if let Some(enabled) = parrot.enabled {
            cfg.parrot.enabled = enabled;
        }
    }

    Ok(SharedConfig::from_parts(cfg))
}

/// Build `SharedConfig` from any reader.
pub fn from_reader<R: Read>(mut reader: R) -> Result<SharedConfig, Box<dyn std::error::Error>> {
    let mut contents = String::new();
    reader.read_to_string(&mut contents)?;
    from_toml_str(&contents)
}

/// Build `SharedConfig` from a TOML configuration file on disk
pub fn from_file<P: AsRef<Path>>(path: P) -> Result<SharedConfig, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    from_reader(BufReader::new(file))
}

fn sorted_keys(map: &HashMap<String, Value>) -> Vec<&String> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    keys
}

fn apply_hbrp_patch(dst: &mut CfgHbrp, src: CfgHbrpDto) {
    if let Some(host) = src.bind_host {
        dst.bind_host = host;
    }
    if let Some(port) = src.bind_port {
        dst.bind_port = port;
    }
    if let Some(depth) = src.incoming_queue {
        dst.incoming_queue = depth;
    }
    if let Some(depth) = src.outgoing_queue {
        dst.outgoing_queue = depth;
    }
}

fn apply_ipsc_patch(src: CfgIpscDto) -> Result<CfgIpsc, Box<dyn std::error::Error>> {
    let auth_key = match src.auth_key {
        Some(hex) => {
            let key = decode_hex(&hex).ok_or_else(|| format!("ipsc.auth_key is not valid hex: {}", hex))?;
            if key.len() != 20 {
                return Err(format!("ipsc.auth_key must be 20 bytes, got {}", key.len()).into());
            }
            Some(key)
        }
        None => None,
    };

    Ok(CfgIpsc {
        bind_host: src.bind_host.unwrap_or_else(|| "0.0.0.0".to_string()),
        bind_port: src.bind_port.unwrap_or(50000),
        peer_id: src.peer_id,
        auth_key,
        stream_max_age_secs: src.stream_max_age_secs.unwrap_or(3),
    })
}

fn apply_kv_patch(dst: &mut CfgKv, src: CfgKvDto) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(backend) = src.backend {
        dst.backend = backend;
    }
    dst.redis_url = src.redis_url;
    if dst.backend == KvBackend::Redis && dst.redis_url.is_none() {
        return Err("kv.backend = \"Redis\" requires kv.redis_url".into());
    }
    Ok(())
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

// ─── TOML DTOs ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TomlConfigRoot {
    config_version: String,
    debug_log: Option<String>,
    hbrp: Option<CfgHbrpDto>,
    ipsc: Option<CfgIpscDto>,
    db: Option<CfgDbDto>,
    kv: Option<CfgKvDto>,
    parrot: Option<CfgParrotDto>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct CfgHbrpDto {
    bind_host: Option<String>,
    bind_port: Option<u16>,
    incoming_queue: Option<usize>,
    outgoing_queue: Option<usize>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct CfgIpscDto {
    bind_host: Option<String>,
    bind_port: Option<u16>,
    peer_id: u32,
    /// 20-byte key as 40 hex characters
    auth_key: Option<String>,
    stream_max_age_secs: Option<u64>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct CfgDbDto {
    path: Option<String>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct CfgKvDto {
    backend: Option<KvBackend>,
    redis_url: Option<String>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct CfgParrotDto {
    enabled: Option<bool>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let cfg = from_toml_str("config_version = \"0.3\"\n").unwrap();
        assert_eq!(cfg.config().hbrp.bind_port, 62031);
        assert_eq!(cfg.config().kv.backend, KvBackend::Memory);
        assert!(cfg.config().ipsc.is_none());
        assert!(cfg.config().parrot.enabled);
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
            config_version = "0.3"
            debug_log = "/tmp/brewhub.log"

            [hbrp]
            bind_host = "127.0.0.1"
            bind_port = 62031

            [ipsc]
            peer_id = 1234
            bind_port = 50001
            auth_key = "000102030405060708090a0b0c0d0e0f10111213"

            [db]
            path = ":memory:"

            [kv]
            backend = "Redis"
            redis_url = "redis://127.0.0.1:6379"
        "#;
        let cfg = from_toml_str(toml).unwrap();
        let ipsc = cfg.config().ipsc.as_ref().unwrap();
        assert_eq!(ipsc.peer_id, 1234);
        assert_eq!(ipsc.bind_port, 50001);
        assert_eq!(ipsc.auth_key.as_ref().unwrap().len(), 20);
        assert_eq!(cfg.config().db.path, ":memory:");
        assert_eq!(cfg.config().kv.backend, KvBackend::Redis);
    }

    #[test]
    fn test_wrong_version_rejected() {
        assert!(from_toml_str("config_version = \"9.9\"\n").is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let toml = "config_version = \"0.3\"\n[hbrp]\nbind_prot = 62031\n";
        let err = from_toml_str(toml).unwrap_err().to_string();
        assert!(err.contains("bind_prot"), "{}", err);
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let toml = "config_version = \"0.3\"\n[kv]\nbackend = \"Redis\"\n";
        assert!(from_toml_str(toml).is_err());
    }

    #[test]
    fn test_bad_auth_key_rejected() {
        let toml = "config_version = \"0.3\"\n[ipsc]\npeer_id = 1\nauth_key = \"abcd\"\n";
        assert!(from_toml_str(toml).is_err());
    }
}
