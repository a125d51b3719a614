//! Bootstrap, snapshot load and watch loop that keep the mirror in step with
//! the store.
//!
//! The engine runs as one spawned task:
//!
//! ```text
//! Init -> Bootstrapping -> SnapshotLoading -> Watching
//!              \                  \              \
//!               +------------------+--------------+--> Failed
//! ```
//!
//! Readiness is reported only once the first watch batch has been applied,
//! so callers never proceed on a snapshot whose change feed is not yet live.

use futures::StreamExt;
use once_cell::sync::OnceCell;
use shared_types::{ChangeSet, ConfigItem, RecordId, RemovedItem};
use std::sync::Arc;
use storage_backend::{EventType, KeyValue, KvSession, WatchBatch};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bootstrap::SessionFactory;
use crate::codec::DocumentCodec;
use crate::error::{RepositoryError, Result};
use crate::failures::FailureSet;
use crate::key::KeyCodec;
use crate::mirror::LocalMirror;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Init,
    Bootstrapping,
    SnapshotLoading,
    Watching,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Failed(RepositoryError),
}

pub type ChangeReceiver<K, T> = broadcast::Receiver<Arc<ChangeSet<K, T>>>;

pub struct SyncEngine<K, T, C> {
    keys: KeyCodec,
    codec: C,
    mirror: LocalMirror<K, T>,
    failures: FailureSet,
    session: OnceCell<Arc<dyn KvSession>>,
    changes: broadcast::Sender<Arc<ChangeSet<K, T>>>,
    state: watch::Sender<SyncState>,
    readiness: watch::Sender<Readiness>,
}

impl<K, T, C> SyncEngine<K, T, C>
where
    K: RecordId,
    T: Clone + Send + Sync + 'static,
    C: DocumentCodec<T>,
{
    pub fn new(keys: KeyCodec, codec: C, change_buffer: usize) -> Self {
        let (changes, _) = broadcast::channel(change_buffer.max(1));
        let (state, _) = watch::channel(SyncState::Init);
        let (readiness, _) = watch::channel(Readiness::Pending);
        Self {
            keys,
            codec,
            mirror: LocalMirror::new(),
            failures: FailureSet::new(),
            session: OnceCell::new(),
            changes,
            state,
            readiness,
        }
    }

    /// Spawn the engine task on the current tokio runtime.
    pub fn start(self: &Arc<Self>, factory: Arc<dyn SessionFactory>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let err = match engine.run(factory.as_ref()).await {
                Ok(()) => RepositoryError::WatchTerminated,
                Err(err) => err,
            };
            error!("Synchronization of {} stopped: {}", engine.keys.prefix(), err);
            engine.fail(err);
        })
    }

    pub fn keys(&self) -> &KeyCodec {
        &self.keys
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn mirror(&self) -> &LocalMirror<K, T> {
        &self.mirror
    }

    pub fn failures(&self) -> &FailureSet {
        &self.failures
    }

    pub fn session(&self) -> Option<&Arc<dyn KvSession>> {
        self.session.get()
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> ChangeReceiver<K, T> {
        self.changes.subscribe()
    }

    /// Resolve once the first watch batch has been applied, or with the error
    /// that stopped the engine.
    pub async fn wait_till_ready(&self) -> Result<()> {
        let mut readiness = self.readiness.subscribe();
        let outcome = readiness
            .wait_for(|readiness| *readiness != Readiness::Pending)
            .await
            .map_err(|_| RepositoryError::Shutdown)?
            .clone();
        match outcome {
            Readiness::Failed(err) => Err(err),
            Readiness::Ready | Readiness::Pending => Ok(()),
        }
    }

    /// Drive the engine until the watch stream ends. Returns `Ok` when the
    /// store ended the stream without an error.
    async fn run(&self, factory: &dyn SessionFactory) -> Result<()> {
        self.transition(SyncState::Bootstrapping);
        let session = factory.open().await?;
        let session = Arc::clone(self.session.get_or_init(|| session));

        self.transition(SyncState::SnapshotLoading);
        let start_revision = self.load_snapshot(session.as_ref()).await?;

        let prefix = self.keys.watch_prefix();
        let mut stream = session.watch(&prefix, start_revision).await?;
        info!("Watching {} from revision {}", prefix, start_revision);
        self.transition(SyncState::Watching);

        while let Some(batch) = stream.next().await {
            let changes = self.apply_batch(batch?);
            let _ = self.changes.send(Arc::new(changes));
            self.mark_ready();
        }

        Ok(())
    }

    /// Read every key under the prefix into the mirror. Returns the revision
    /// the watch must start from.
    async fn load_snapshot(&self, session: &dyn KvSession) -> Result<i64> {
        let response = session.range(&self.keys.watch_prefix()).await?;
        let mut max_revision = 0;

        for kv in &response.kvs {
            max_revision = max_revision.max(kv.mod_revision);
            match self.decode_entry(kv) {
                Ok(item) => {
                    self.mirror.upsert(&kv.key, item);
                }
                Err(err) => {
                    self.failures.insert(&kv.key);
                    error!("Error loading key {}: {}", kv.key, err);
                }
            }
        }

        info!(
            "Loaded {} records from {} ({} failed)",
            self.mirror.len(),
            self.keys.prefix(),
            self.failures.len()
        );

        // The read was served at `response.revision`, which is never below the
        // newest entry; starting there (inclusive) leaves no gap before the watch.
        Ok(max_revision.max(response.revision))
    }

    /// Apply one watch batch to the mirror and failure set, returning what it
    /// changed. Undecodable puts leave the mirror untouched and mark the key.
    pub fn apply_batch(&self, batch: WatchBatch) -> ChangeSet<K, T> {
        let mut changes = ChangeSet::default();

        for event in batch.events {
            let key = event.kv.key.as_str();
            match event.event_type {
                EventType::Delete => match self.apply_delete(key) {
                    Ok(removed) => {
                        self.failures.remove(key);
                        changes.removed.push(removed);
                    }
                    Err(err) => {
                        self.failures.insert(key);
                        error!("Error processing delete event for key {}: {}", key, err);
                    }
                },
                EventType::Put => match self.decode_entry(&event.kv) {
                    Ok(item) => {
                        self.mirror.upsert(key, item.clone());
                        if self.failures.remove(key) {
                            info!("Key {} recovered from an earlier decode failure", key);
                        }
                        changes.updated.push(item);
                    }
                    Err(err) => {
                        self.failures.insert(key);
                        if self.mirror.contains_key(key) {
                            warn!("Keeping previous value of {} after decode failure: {}", key, err);
                        } else {
                            error!("Error processing put event for key {}: {}", key, err);
                        }
                    }
                },
            }
        }

        debug!(
            "Applied watch batch at revision {}: {} updated, {} removed",
            batch.revision,
            changes.updated.len(),
            changes.removed.len()
        );
        changes
    }

    fn apply_delete(&self, key: &str) -> Result<RemovedItem<K, T>> {
        if let Some(previous) = self.mirror.remove(key) {
            return Ok(RemovedItem {
                id: previous.id.clone(),
                folder_path: previous.folder_path.clone(),
                previous: Some(previous),
            });
        }
        // Never saw this record, so all that is known is what the key says.
        let (id, folder_path) = self.keys.decode::<K>(key)?;
        Ok(RemovedItem {
            id,
            folder_path,
            previous: None,
        })
    }

    fn decode_entry(&self, kv: &KeyValue) -> Result<ConfigItem<K, T>> {
        let (id, folder_path) = self.keys.decode::<K>(&kv.key)?;
        let document = self
            .codec
            .decode(&kv.value)
            .map_err(|err| RepositoryError::Decode {
                key: kv.key.clone(),
                reason: err.to_string(),
            })?;
        Ok(ConfigItem {
            id,
            folder_path,
            version: kv.mod_revision,
            created_on: document.created_on,
            modified_on: document.modified_on,
            data: document.data,
        })
    }

    fn transition(&self, state: SyncState) {
        debug!("Synchronization of {} entering {:?}", self.keys.prefix(), state);
        self.state.send_replace(state);
    }

    fn mark_ready(&self) {
        let became_ready = self.readiness.send_if_modified(|readiness| {
            if *readiness == Readiness::Pending {
                *readiness = Readiness::Ready;
                true
            } else {
                false
            }
        });
        if became_ready {
            info!("Repository {} is ready", self.keys.prefix());
        }
    }

    fn fail(&self, err: RepositoryError) {
        self.state.send_replace(SyncState::Failed);
        self.readiness.send_replace(Readiness::Failed(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Document, JsonCodec};
    use bytes::Bytes;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use shared_types::Scope;
    use storage_backend::WatchEvent;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Setting {
        name: String,
    }

    type Engine = SyncEngine<String, Setting, JsonCodec>;

    fn engine() -> Engine {
        SyncEngine::new(KeyCodec::new(Scope::Global, "setting"), JsonCodec, 16)
    }

    fn encoded(name: &str) -> Bytes {
        let data = Setting {
            name: name.to_string(),
        };
        let document = Document {
            created_on: Utc::now(),
            modified_on: None,
            data: &data,
        };
        Bytes::from(JsonCodec.encode(&document).unwrap())
    }

    fn put(key: &str, value: Bytes, revision: i64) -> WatchEvent {
        WatchEvent {
            event_type: EventType::Put,
            kv: KeyValue {
                key: key.to_string(),
                value,
                create_revision: revision,
                mod_revision: revision,
            },
        }
    }

    fn delete(key: &str, revision: i64) -> WatchEvent {
        WatchEvent {
            event_type: EventType::Delete,
            kv: KeyValue {
                key: key.to_string(),
                value: Bytes::new(),
                create_revision: 0,
                mod_revision: revision,
            },
        }
    }

    fn batch(events: Vec<WatchEvent>) -> WatchBatch {
        WatchBatch {
            revision: events.last().map_or(0, WatchEvent::revision),
            events,
        }
    }

    #[test]
    fn test_put_populates_identity_and_version() {
        let engine = engine();
        let changes = engine.apply_batch(batch(vec![put(
            "/global/setting/team/a/bob",
            encoded("x"),
            7,
        )]));

        assert_eq!(changes.updated.len(), 1);
        let item = engine.mirror().get("/global/setting/team/a/bob").unwrap();
        assert_eq!(item.id, "bob");
        assert_eq!(item.folder_path.as_deref(), Some("/team/a"));
        assert_eq!(item.version, 7);
        assert_eq!(item.data.name, "x");
    }

    #[test]
    fn test_later_put_overwrites() {
        let engine = engine();
        engine.apply_batch(batch(vec![
            put("/global/setting/a", encoded("first"), 1),
            put("/global/setting/a", encoded("second"), 2),
        ]));

        let item = engine.mirror().get("/global/setting/a").unwrap();
        assert_eq!(item.data.name, "second");
        assert_eq!(item.version, 2);
    }

    #[test]
    fn test_delete_returns_previous_value() {
        let engine = engine();
        engine.apply_batch(batch(vec![put("/global/setting/a", encoded("x"), 1)]));

        let changes = engine.apply_batch(batch(vec![delete("/global/setting/a", 2)]));

        assert!(engine.mirror().is_empty());
        let removed = &changes.removed[0];
        assert_eq!(removed.id, "a");
        assert_eq!(removed.previous.as_ref().unwrap().data.name, "x");
    }

    #[test]
    fn test_delete_of_unseen_key_synthesizes_identity() {
        let engine = engine();
        let changes = engine.apply_batch(batch(vec![delete("/global/setting/f/ghost", 3)]));

        assert_eq!(changes.removed.len(), 1);
        let removed = &changes.removed[0];
        assert_eq!(removed.id, "ghost");
        assert_eq!(removed.folder_path.as_deref(), Some("/f"));
        assert!(removed.previous.is_none());
    }

    #[test]
    fn test_decode_failure_on_new_key_is_isolated() {
        let engine = engine();
        let changes = engine.apply_batch(batch(vec![
            put("/global/setting/bad", Bytes::from_static(b"{oops"), 1),
            put("/global/setting/good", encoded("ok"), 2),
        ]));

        assert_eq!(changes.updated.len(), 1);
        assert_eq!(changes.updated[0].id, "good");
        assert!(engine.failures().contains("/global/setting/bad"));
        assert!(engine.mirror().get("/global/setting/bad").is_none());
    }

    #[test]
    fn test_decode_failure_keeps_previous_value() {
        let engine = engine();
        engine.apply_batch(batch(vec![put("/global/setting/a", encoded("good"), 1)]));

        let changes =
            engine.apply_batch(batch(vec![put("/global/setting/a", Bytes::from_static(b"[]"), 2)]));

        assert!(changes.is_empty());
        assert!(engine.failures().contains("/global/setting/a"));
        let item = engine.mirror().get("/global/setting/a").unwrap();
        assert_eq!(item.data.name, "good");
        assert_eq!(item.version, 1);
    }

    #[test]
    fn test_successful_put_clears_failure() {
        let engine = engine();
        engine.apply_batch(batch(vec![put("/global/setting/a", Bytes::from_static(b"?"), 1)]));
        assert!(engine.failures().contains("/global/setting/a"));

        engine.apply_batch(batch(vec![put("/global/setting/a", encoded("fixed"), 2)]));

        assert!(engine.failures().is_empty());
        assert_eq!(engine.mirror().get("/global/setting/a").unwrap().data.name, "fixed");
    }

    #[test]
    fn test_delete_clears_failure() {
        let engine = engine();
        engine.apply_batch(batch(vec![put("/global/setting/a", Bytes::from_static(b"?"), 1)]));

        let changes = engine.apply_batch(batch(vec![delete("/global/setting/a", 2)]));

        assert!(engine.failures().is_empty());
        assert!(changes.removed[0].previous.is_none());
    }

    #[test]
    fn test_undecodable_key_marks_failure() {
        let engine: SyncEngine<i64, Setting, JsonCodec> =
            SyncEngine::new(KeyCodec::new(Scope::Global, "setting"), JsonCodec, 16);

        let changes = engine.apply_batch(batch(vec![
            put("/global/setting/not-a-number", encoded("x"), 1),
            delete("/global/setting/also-not", 2),
        ]));

        assert!(changes.is_empty());
        assert_eq!(
            engine.failures().keys(),
            vec!["/global/setting/also-not", "/global/setting/not-a-number"]
        );
    }

    #[test]
    fn test_initial_state() {
        let engine = engine();
        assert_eq!(engine.state(), SyncState::Init);
        assert!(engine.session().is_none());
    }
}
