//! Session boundary to a revisioned key-value store.
//!
//! Every mutation advances a single store-wide revision. Keys remember the
//! revision that created them and the revision that last modified them, which
//! is what conditional writes compare against and what watches resume from.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod error;
pub mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;


use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;

#[cfg(feature = "etcd")]
pub use etcd::EtcdSession;

/// A stored key and its revision metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    pub create_revision: i64,
    pub mod_revision: i64,
}

/// Result of a prefix range read.
#[derive(Debug, Clone, Default)]
pub struct RangeResponse {
    /// Store revision the read was served at.
    pub revision: i64,
    pub kvs: Vec<KeyValue>,
}

/// Liveness report from a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStatus {
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// One change observed by a watch.
///
/// For deletes `kv.value` is empty and `kv.mod_revision` is the revision of
/// the delete itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub kv: KeyValue,
}

impl WatchEvent {
    pub fn revision(&self) -> i64 {
        self.kv.mod_revision
    }
}

/// A batch of events delivered by one watch response.
///
/// The first batch of every watch is delivered as soon as the watch is
/// registered and may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchBatch {
    /// Store revision when the batch was produced.
    pub revision: i64,
    pub events: Vec<WatchEvent>,
}

pub type WatchStream = BoxStream<'static, Result<WatchBatch>>;

/// Prefix `events` with the empty batch that acknowledges registration.
///
/// For sessions whose transport consumes the registration response itself and
/// then only yields batches that carry events.
pub fn registered(revision: i64, events: WatchStream) -> WatchStream {
    stream::once(async move {
        Ok(WatchBatch {
            revision,
            events: Vec::new(),
        })
    })
    .chain(events)
    .boxed()
}

/// Guard of a conditional put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Key's create revision must equal the value; `0` asserts absence.
    CreateRevision(i64),
    /// Key's last modification revision must equal the value.
    ModRevision(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnOutcome {
    pub succeeded: bool,
    /// Store revision after the transaction.
    pub revision: i64,
}

#[async_trait]
pub trait KvSession: Send + Sync {
    async fn status(&self) -> Result<StoreStatus>;

    async fn range(&self, prefix: &str) -> Result<RangeResponse>;

    /// Watch every key starting with `prefix`, replaying history from
    /// `start_revision` inclusive.
    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream>;

    /// Unconditional put. Returns the revision of the write.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64>;

    /// Put `value` only if `condition` holds, as one atomic transaction.
    async fn put_if(&self, key: &str, value: Vec<u8>, condition: Precondition)
        -> Result<TxnOutcome>;

    /// Unconditional delete. Returns the store revision after the delete.
    async fn delete(&self, key: &str) -> Result<i64>;
}
