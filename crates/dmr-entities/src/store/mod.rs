//! External collaborators: the shared KV store with per-key TTL, the
//! raw-datagram pub/sub bus, and the relational database.

pub mod bus;
pub mod db;
pub mod kv;

pub use bus::{MemoryBus, PubSub, RawDatagram, RedisBus};
pub use db::{Db, DbError};
pub use kv::{KvError, KvStore, MemoryKv, RedisKv};
