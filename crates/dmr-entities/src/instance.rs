//! Multi-replica instance registry: each server instance heartbeats a
//! TTL'd KV key; shutdown consults the registry to decide whether the
//! MSTCL disconnect broadcast can be skipped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use uuid::Uuid;

use crate::store::{KvError, KvStore};

pub const INSTANCE_TTL: Duration = Duration::from_secs(30);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

const KEY_PREFIX: &str = "dmrhub:instance:";

#[derive(Clone)]
pub struct InstanceRegistry {
    kv: Arc<dyn KvStore>,
    id: Uuid,
}

impl InstanceRegistry {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv, id: Uuid::new_v4() }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn key(&self) -> String {
        format!("{}{}", KEY_PREFIX, self.id)
    }

    /// Write (or refresh) our registry key
    pub fn register(&self) -> Result<(), KvError> {
        self.kv.set_ex(&self.key(), b"1", INSTANCE_TTL)
    }

    pub fn deregister(&self) -> Result<(), KvError> {
        self.kv.delete(&self.key()).map(|_| ())
    }

    /// True if any *other* instance is currently registered; repeaters
    /// in flight will be picked up there after our shutdown.
    pub fn others_alive(&self) -> Result<bool, KvError> {
        let own = self.key();
        let keys = self.kv.scan_prefix(KEY_PREFIX)?;
        Ok(keys.iter().any(|k| *k != own))
    }

    /// Heartbeat loop refreshing the registry key until `stop` is set
    pub fn spawn_heartbeat(&self, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
        let registry = self.clone();
        thread::Builder::new()
            .name("instance-heartbeat".to_string())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(HEARTBEAT_INTERVAL);
                'outer: while !stop.load(Ordering::SeqCst) {
                    if let Err(e) = registry.register() {
                        tracing::error!("InstanceRegistry: heartbeat failed: {}", e);
                    }
                    // Wait for the next tick, polling the stop flag so
                    // shutdown is noticed promptly
                    loop {
                        if stop.load(Ordering::SeqCst) {
                            break 'outer;
                        }
                        if ticker.recv_timeout(Duration::from_millis(500)).is_ok() {
                            break;
                        }
                    }
                }
                tracing::debug!("InstanceRegistry: heartbeat stopped");
            })
            .expect("failed to spawn instance-heartbeat thread")
    }
}
