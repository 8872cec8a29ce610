//! Ephemeral shared state: a string-keyed byte store with per-key TTL,
//! prefix scan and an ordered list per key. Backed either by an
//! in-process map (single instance, tests) or a shared Redis.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use redis::Commands;

#[derive(Debug)]
pub enum KvError {
    /// Key absent (or expired)
    NoSuchKey,
    /// Stored bytes failed to deserialize
    Decode(String),
    /// Backend I/O failure
    Backend(String),
}

impl std::fmt::Display for KvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSuchKey => write!(f, "no such key"),
            Self::Decode(e) => write!(f, "decode failed: {}", e),
            Self::Backend(e) => write!(f, "kv backend: {}", e),
        }
    }
}

impl From<redis::RedisError> for KvError {
    fn from(e: redis::RedisError) -> Self {
        KvError::Backend(e.to_string())
    }
}

/// The KV contract shared by all entities. Implementations are safe for
/// concurrent use; no cross-key transactions are offered. `list_take`
/// is atomic per key (snapshot-then-delete).
pub trait KvStore: Send + Sync {
    fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), KvError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, KvError>;
    fn exists(&self, key: &str) -> Result<bool, KvError>;
    /// Refresh a key's TTL. Returns false if the key does not exist.
    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;
    fn delete(&self, key: &str) -> Result<bool, KvError>;
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError>;
    /// Append to the ordered list at `key`, setting its TTL
    fn list_push(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), KvError>;
    /// Atomically read the whole list and delete the key
    fn list_take(&self, key: &str) -> Result<Vec<Vec<u8>>, KvError>;
}

// ─── In-process backend ───────────────────────────────────────────

enum Entry {
    Value(Vec<u8>),
    List(Vec<Vec<u8>>),
}

struct Slot {
    entry: Entry,
    deadline: Instant,
}

/// Mutexed map with deadline-based expiry, evaluated lazily on access
#[derive(Default)]
pub struct MemoryKv {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), KvError> {
        let mut slots = self.slots.lock().unwrap();
        slots.insert(
            key.to_string(),
            Slot {
                entry: Entry::Value(value.to_vec()),
                deadline: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, KvError> {
        let mut slots = self.slots.lock().unwrap();
        match slots.get(key) {
            Some(slot) if slot.deadline > Instant::now() => match &slot.entry {
                Entry::Value(v) => Ok(v.clone()),
                Entry::List(_) => Err(KvError::Decode("list key read as value".to_string())),
            },
            Some(_) => {
                slots.remove(key);
                Err(KvError::NoSuchKey)
            }
            None => Err(KvError::NoSuchKey),
        }
    }

    fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut slots = self.slots.lock().unwrap();
        match slots.get(key) {
            Some(slot) if slot.deadline > Instant::now() => Ok(true),
            Some(_) => {
                slots.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut slots = self.slots.lock().unwrap();
        match slots.get_mut(key) {
            Some(slot) if slot.deadline > Instant::now() => {
                slot.deadline = Instant::now() + ttl;
                Ok(true)
            }
            Some(_) => {
                slots.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn delete(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.slots.lock().unwrap().remove(key).is_some())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let now = Instant::now();
        let slots = self.slots.lock().unwrap();
        Ok(slots
            .iter()
            .filter(|(k, slot)| k.starts_with(prefix) && slot.deadline > now)
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn list_push(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), KvError> {
        let mut slots = self.slots.lock().unwrap();
        let deadline = Instant::now() + ttl;
        match slots.get_mut(key) {
            Some(slot) if slot.deadline > Instant::now() => {
                if let Entry::List(items) = &mut slot.entry {
                    items.push(value.to_vec());
                    slot.deadline = deadline;
                    return Ok(());
                }
                Err(KvError::Decode("value key pushed as list".to_string()))
            }
            _ => {
                slots.insert(
                    key.to_string(),
                    Slot {
                        entry: Entry::List(vec![value.to_vec()]),
                        deadline,
                    },
                );
                Ok(())
            }
        }
    }

    fn list_take(&self, key: &str) -> Result<Vec<Vec<u8>>, KvError> {
        let mut slots = self.slots.lock().unwrap();
        match slots.remove(key) {
            Some(slot) if slot.deadline > Instant::now() => match slot.entry {
                Entry::List(items) => Ok(items),
                Entry::Value(_) => Err(KvError::Decode("value key taken as list".to_string())),
            },
            _ => Ok(Vec::new()),
        }
    }
}

// ─── Redis backend ────────────────────────────────────────────────

/// Shared Redis, for multi-replica deployments. The synchronous
/// connection is mutexed; per-operation latency dominates here, not
/// lock contention.
pub struct RedisKv {
    conn: Mutex<redis::Connection>,
}

impl RedisKv {
    pub fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url).map_err(KvError::from)?;
        let conn = client.get_connection().map_err(KvError::from)?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

impl KvStore for RedisKv {
    fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn.lock().unwrap();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).map_err(KvError::from)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, KvError> {
        let mut conn = self.conn.lock().unwrap();
        let value: Option<Vec<u8>> = conn.get(key).map_err(KvError::from)?;
        value.ok_or(KvError::NoSuchKey)
    }

    fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn.lock().unwrap();
        conn.exists(key).map_err(KvError::from)
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.conn.lock().unwrap();
        conn.expire(key, ttl.as_secs() as i64).map_err(KvError::from)
    }

    fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn.lock().unwrap();
        let removed: u32 = conn.del(key).map_err(KvError::from)?;
        Ok(removed > 0)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn.lock().unwrap();
        conn.keys(format!("{}*", prefix)).map_err(KvError::from)
    }

    fn list_push(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn.lock().unwrap();
        redis::pipe()
            .rpush(key, value)
            .ignore()
            .expire(key, ttl.as_secs() as i64)
            .ignore()
            .query::<()>(&mut *conn)
            .map_err(KvError::from)
    }

    fn list_take(&self, key: &str) -> Result<Vec<Vec<u8>>, KvError> {
        let mut conn = self.conn.lock().unwrap();
        let (items, _): (Vec<Vec<u8>>, u32) = redis::pipe()
            .atomic()
            .lrange(key, 0, -1)
            .del(key)
            .query(&mut *conn)
            .map_err(KvError::from)?;
        Ok(items)
    }
}
