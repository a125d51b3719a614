use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, instrument};

use crate::error::{Result, StoreError};
use crate::{
    EventType, KeyValue, KvSession, Precondition, RangeResponse, StoreStatus, TxnOutcome,
    WatchBatch, WatchEvent, WatchStream,
};

/// In-process revisioned key-value store.
///
/// Follows etcd semantics closely enough to stand in for a cluster: one
/// store-wide revision, create/mod revisions per key, prefix watches that
/// replay retained history, and deletes of missing keys that change nothing.
/// Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    revision: i64,
    index: BTreeMap<String, KeyValue>,
    history: Vec<WatchEvent>,
    watchers: Vec<Watcher>,
    healthy: bool,
    readable: bool,
    compacted: i64,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            revision: 0,
            index: BTreeMap::new(),
            history: Vec::new(),
            watchers: Vec::new(),
            healthy: true,
            readable: true,
            compacted: 0,
        }
    }
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Result<WatchBatch>>,
}

impl Inner {
    fn apply_put(&mut self, key: &str, value: Vec<u8>) -> i64 {
        self.revision += 1;
        let create_revision = self
            .index
            .get(key)
            .map_or(self.revision, |existing| existing.create_revision);
        let kv = KeyValue {
            key: key.to_string(),
            value: Bytes::from(value),
            create_revision,
            mod_revision: self.revision,
        };
        self.index.insert(key.to_string(), kv.clone());
        self.record(WatchEvent {
            event_type: EventType::Put,
            kv,
        });
        self.revision
    }

    fn record(&mut self, event: WatchEvent) {
        let revision = self.revision;
        self.watchers.retain(|watcher| {
            if !event.kv.key.starts_with(&watcher.prefix) {
                return !watcher.tx.is_closed();
            }
            watcher
                .tx
                .send(Ok(WatchBatch {
                    revision,
                    events: vec![event.clone()],
                }))
                .is_ok()
        });
        self.history.push(event);
    }

    fn check(&self, key: &str, condition: Precondition) -> bool {
        let existing = self.index.get(key);
        match condition {
            Precondition::CreateRevision(expected) => {
                existing.map_or(0, |kv| kv.create_revision) == expected
            }
            Precondition::ModRevision(expected) => {
                existing.map_or(0, |kv| kv.mod_revision) == expected
            }
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn revision(&self) -> i64 {
        self.inner.lock().await.revision
    }

    pub async fn get(&self, key: &str) -> Option<KeyValue> {
        self.inner.lock().await.index.get(key).cloned()
    }

    /// Make `status` fail, as an unreachable member would.
    pub async fn set_healthy(&self, healthy: bool) {
        self.inner.lock().await.healthy = healthy;
    }

    /// Make `range` fail while `status` keeps succeeding.
    pub async fn set_readable(&self, readable: bool) {
        self.inner.lock().await.readable = readable;
    }

    /// Drop history older than `revision`. Watches can no longer start below it.
    pub async fn compact(&self, revision: i64) {
        let mut inner = self.inner.lock().await;
        let revision = revision.min(inner.revision);
        if revision <= inner.compacted {
            return;
        }
        inner.history.retain(|event| event.revision() >= revision);
        inner.compacted = revision;
        debug!("Compacted history below revision {}", revision);
    }

    /// Terminate every open watch stream.
    pub async fn disconnect_watchers(&self) {
        let mut inner = self.inner.lock().await;
        for watcher in inner.watchers.drain(..) {
            let _ = watcher.tx.send(Err(StoreError::WatchClosed));
        }
    }

    fn ensure_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey("key must not be empty".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvSession for MemoryStore {
    async fn status(&self) -> Result<StoreStatus> {
        let inner = self.inner.lock().await;
        if !inner.healthy {
            return Err(StoreError::Unavailable(
                "member is not serving requests".to_string(),
            ));
        }
        Ok(StoreStatus {
            revision: inner.revision,
        })
    }

    #[instrument(skip(self))]
    async fn range(&self, prefix: &str) -> Result<RangeResponse> {
        let inner = self.inner.lock().await;
        if !inner.readable {
            return Err(StoreError::Unavailable("range reads are failing".to_string()));
        }
        let kvs: Vec<KeyValue> = inner
            .index
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        debug!("Range read returned {} keys", kvs.len());
        Ok(RangeResponse {
            revision: inner.revision,
            kvs,
        })
    }

    #[instrument(skip(self))]
    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
        let mut inner = self.inner.lock().await;
        if start_revision > 0 && start_revision < inner.compacted {
            return Err(StoreError::Compacted {
                requested: start_revision,
                compacted: inner.compacted,
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();

        let replay: Vec<WatchEvent> = inner
            .history
            .iter()
            .filter(|event| event.revision() >= start_revision && event.kv.key.starts_with(prefix))
            .cloned()
            .collect();
        debug!("Watch registered, replaying {} events", replay.len());

        // Registration is acknowledged with a first batch even when nothing is replayed.
        let _ = tx.send(Ok(WatchBatch {
            revision: inner.revision,
            events: replay,
        }));
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|batch| (batch, rx))
        });
        Ok(stream.boxed())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64> {
        Self::ensure_key(key)?;
        let mut inner = self.inner.lock().await;
        Ok(inner.apply_put(key, value))
    }

    async fn put_if(
        &self,
        key: &str,
        value: Vec<u8>,
        condition: Precondition,
    ) -> Result<TxnOutcome> {
        Self::ensure_key(key)?;
        let mut inner = self.inner.lock().await;
        if !inner.check(key, condition) {
            debug!("Condition {:?} failed for key {}", condition, key);
            return Ok(TxnOutcome {
                succeeded: false,
                revision: inner.revision,
            });
        }
        let revision = inner.apply_put(key, value);
        Ok(TxnOutcome {
            succeeded: true,
            revision,
        })
    }

    async fn delete(&self, key: &str) -> Result<i64> {
        Self::ensure_key(key)?;
        let mut inner = self.inner.lock().await;
        let Some(existing) = inner.index.remove(key) else {
            return Ok(inner.revision);
        };
        inner.revision += 1;
        let kv = KeyValue {
            key: existing.key,
            value: Bytes::new(),
            create_revision: 0,
            mod_revision: inner.revision,
        };
        inner.record(WatchEvent {
            event_type: EventType::Delete,
            kv,
        });
        Ok(inner.revision)
    }
}
