//! Topic-based broadcast bus for raw outgoing datagrams. Payloads are
//! msgpack-encoded `RawDatagram` records so replicas can forward wire
//! bytes without re-parsing them.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};

use super::kv::KvError;

/// Raw datagrams from peer replicas for the local socket
pub const TOPIC_INCOMING: &str = "incoming";
/// Raw datagrams any replica may transmit
pub const TOPIC_OUTGOING: &str = "outgoing";
/// Reserved for cross-network peering
pub const TOPIC_OPENBRIDGE_OUTGOING: &str = "openbridge:outgoing";

/// A serialized UDP datagram with its destination endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDatagram {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub remote_ip: String,
    pub remote_port: u16,
}

impl RawDatagram {
    pub fn to_msgpack(&self) -> Result<Vec<u8>, KvError> {
        rmp_serde::to_vec(self).map_err(|e| KvError::Decode(e.to_string()))
    }

    pub fn from_msgpack(data: &[u8]) -> Result<Self, KvError> {
        rmp_serde::from_slice(data).map_err(|e| KvError::Decode(e.to_string()))
    }
}

/// Broadcast bus contract: publish bytes to a topic, subscribe to drain
/// a topic through a channel receiver.
pub trait PubSub: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), KvError>;
    fn subscribe(&self, topic: &str) -> Result<Receiver<Vec<u8>>, KvError>;
}

// ─── In-process backend ───────────────────────────────────────────

/// Fan-out to in-process subscribers. Single-instance deployments and
/// tests; with this bus, "cross-replica" forwarding loops back locally.
#[derive(Default)]
pub struct MemoryBus {
    subscribers: Mutex<HashMap<String, Vec<Sender<Vec<u8>>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PubSub for MemoryBus {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), KvError> {
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(senders) = subscribers.get_mut(topic) {
            // Drop subscribers whose receiver side is gone
            senders.retain(|tx| tx.send(payload.to_vec()).is_ok());
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<Receiver<Vec<u8>>, KvError> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

// ─── Redis backend ────────────────────────────────────────────────

/// Redis pub/sub. Each subscription runs a dedicated drain thread with
/// its own connection, pushing message payloads into a channel.
pub struct RedisBus {
    client: redis::Client,
    conn: Mutex<redis::Connection>,
}

impl RedisBus {
    pub fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url).map_err(KvError::from)?;
        let conn = client.get_connection().map_err(KvError::from)?;
        Ok(Self { client, conn: Mutex::new(conn) })
    }
}

impl PubSub for RedisBus {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), KvError> {
        let mut conn = self.conn.lock().unwrap();
        redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query::<()>(&mut *conn)
            .map_err(KvError::from)
    }

    fn subscribe(&self, topic: &str) -> Result<Receiver<Vec<u8>>, KvError> {
        let mut conn = self.client.get_connection().map_err(KvError::from)?;
        let (tx, rx) = unbounded::<Vec<u8>>();
        let topic_owned = topic.to_string();

        thread::Builder::new()
            .name(format!("bus-sub-{}", topic))
            .spawn(move || {
                let mut pubsub = conn.as_pubsub();
                if let Err(e) = pubsub.subscribe(&topic_owned) {
                    tracing::error!("RedisBus: subscribe {} failed: {}", topic_owned, e);
                    return;
                }
                loop {
                    match pubsub.get_message() {
                        Ok(msg) => {
                            let payload: Vec<u8> = match msg.get_payload() {
                                Ok(p) => p,
                                Err(e) => {
                                    tracing::warn!("RedisBus: bad payload on {}: {}", topic_owned, e);
                                    continue;
                                }
                            };
                            if tx.send(payload).is_err() {
                                // Receiver dropped; stop draining
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::error!("RedisBus: get_message on {} failed: {}", topic_owned, e);
                            break;
                        }
                    }
                }
            })
            .map_err(|e| KvError::Backend(format!("spawn subscriber thread: {}", e)))?;

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_bus_fan_out() {
        let bus = MemoryBus::new();
        let rx1 = bus.subscribe(TOPIC_OUTGOING).unwrap();
        let rx2 = bus.subscribe(TOPIC_OUTGOING).unwrap();
        bus.publish(TOPIC_OUTGOING, b"datagram").unwrap();
        assert_eq!(rx1.recv().unwrap(), b"datagram");
        assert_eq!(rx2.recv().unwrap(), b"datagram");
    }

    #[test]
    fn test_topics_are_isolated() {
        let bus = MemoryBus::new();
        let rx = bus.subscribe(TOPIC_INCOMING).unwrap();
        bus.publish(TOPIC_OUTGOING, b"elsewhere").unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = MemoryBus::new();
        let rx = bus.subscribe(TOPIC_OUTGOING).unwrap();
        drop(rx);
        // must not error once the receiver is gone
        bus.publish(TOPIC_OUTGOING, b"x").unwrap();
        bus.publish(TOPIC_OUTGOING, b"y").unwrap();
    }

    #[test]
    fn test_raw_datagram_msgpack_round_trip() {
        let datagram = RawDatagram {
            data: vec![0x44, 0x4D, 0x52, 0x44],
            remote_ip: "198.51.100.7".to_string(),
            remote_port: 62031,
        };
        let packed = datagram.to_msgpack().unwrap();
        assert_eq!(RawDatagram::from_msgpack(&packed).unwrap(), datagram);
    }
}
