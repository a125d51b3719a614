use async_trait::async_trait;
use chrono::Utc;
use shared_types::{ConfigItem, RecordId};
use std::sync::Arc;
use storage_backend::{KvSession, Precondition};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::bootstrap::SessionFactory;
use crate::codec::{Document, DocumentCodec, JsonCodec};
use crate::config::RepositoryOptions;
use crate::error::{RepositoryError, Result};
use crate::key::{normalize_folder, KeyCodec, SEPARATOR};
use crate::sync::{ChangeReceiver, SyncEngine, SyncState};

/// Public surface of a configuration repository.
#[async_trait]
pub trait ConfigurationRepository<K, T>: Send + Sync
where
    K: RecordId,
    T: Clone + Send + Sync + 'static,
{
    /// Wait until the snapshot is loaded and the change feed is live.
    async fn wait_till_ready(&self) -> Result<()>;

    async fn get_all(&self) -> Result<Vec<ConfigItem<K, T>>>;

    /// Get a record stored at the root folder.
    async fn get(&self, id: &K) -> Result<Option<ConfigItem<K, T>>> {
        self.get_in(None, id).await
    }

    async fn get_in(&self, folder: Option<&str>, id: &K) -> Result<Option<ConfigItem<K, T>>>;

    /// Add or update a record. Without `force` the write only succeeds if
    /// `item.version` is still the record's current version (or `0` and the
    /// record does not exist yet). On success `item.version` holds the new
    /// version, which is also returned.
    async fn set(&self, item: &mut ConfigItem<K, T>, force: bool) -> Result<i64>;

    /// Remove a record stored at the root folder.
    async fn remove(&self, id: &K) -> Result<()> {
        self.remove_in(None, id).await
    }

    async fn remove_item(&self, item: &ConfigItem<K, T>) -> Result<()> {
        self.remove_in(item.folder_path.as_deref(), &item.id).await
    }

    async fn remove_in(&self, folder: Option<&str>, id: &K) -> Result<()>;

    /// Receive one `ChangeSet` per applied watch batch.
    fn subscribe(&self) -> ChangeReceiver<K, T>;

    /// Canonical keys whose latest value could not be decoded.
    fn failed_to_load(&self) -> Vec<String>;
}

/// Locally mirrored, watch-synchronized configuration repository.
///
/// Construction spawns the synchronization task, so it must happen inside a
/// tokio runtime. Reads are served from the mirror; writes go to the store
/// and reach the mirror through the watch.
pub struct ConfigRepository<K, T, C = JsonCodec> {
    engine: Arc<SyncEngine<K, T, C>>,
    task: JoinHandle<()>,
}

impl<K, T> ConfigRepository<K, T, JsonCodec>
where
    K: RecordId,
    T: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn with_json(options: RepositoryOptions, factory: impl SessionFactory + 'static) -> Self {
        Self::new(options, factory, JsonCodec)
    }
}

impl<K, T, C> ConfigRepository<K, T, C>
where
    K: RecordId,
    T: Clone + Send + Sync + 'static,
    C: DocumentCodec<T>,
{
    pub fn new(options: RepositoryOptions, factory: impl SessionFactory + 'static, codec: C) -> Self {
        let keys = KeyCodec::new(options.scope, &options.type_name);
        let engine = Arc::new(SyncEngine::new(keys, codec, options.change_buffer));
        let task = engine.start(Arc::new(factory));
        Self { engine, task }
    }

    pub fn state(&self) -> SyncState {
        self.engine.state()
    }

    pub fn keys(&self) -> &KeyCodec {
        self.engine.keys()
    }

    fn validate_id(id: &K) -> Result<()> {
        if id.is_unset() {
            return Err(RepositoryError::InvalidArgument(
                "id must not be the default value".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_writable_id(id: &K) -> Result<()> {
        Self::validate_id(id)?;
        if id.to_string().contains(SEPARATOR) {
            return Err(RepositoryError::InvalidArgument(format!(
                "id {id} must not contain '{SEPARATOR}'"
            )));
        }
        Ok(())
    }

    async fn ready_session(&self) -> Result<&Arc<dyn KvSession>> {
        self.engine.wait_till_ready().await?;
        self.engine.session().ok_or(RepositoryError::Shutdown)
    }
}

#[async_trait]
impl<K, T, C> ConfigurationRepository<K, T> for ConfigRepository<K, T, C>
where
    K: RecordId,
    T: Clone + Send + Sync + 'static,
    C: DocumentCodec<T>,
{
    async fn wait_till_ready(&self) -> Result<()> {
        self.engine.wait_till_ready().await
    }

    async fn get_all(&self) -> Result<Vec<ConfigItem<K, T>>> {
        self.engine.wait_till_ready().await?;
        Ok(self.engine.mirror().values())
    }

    async fn get_in(&self, folder: Option<&str>, id: &K) -> Result<Option<ConfigItem<K, T>>> {
        Self::validate_id(id)?;
        self.engine.wait_till_ready().await?;
        let key = self.engine.keys().encode(folder, id);
        Ok(self.engine.mirror().get(&key))
    }

    #[instrument(skip(self, item), fields(id = %item.id, version = item.version))]
    async fn set(&self, item: &mut ConfigItem<K, T>, force: bool) -> Result<i64> {
        Self::validate_writable_id(&item.id)?;
        let session = self.ready_session().await?;

        let folder_path = normalize_folder(item.folder_path.as_deref());
        let key = self.engine.keys().encode(folder_path.as_deref(), &item.id);

        let now = Utc::now();
        let (created_on, modified_on) = if item.version == 0 || force {
            (now, item.modified_on)
        } else {
            (item.created_on, Some(now))
        };

        let payload = self
            .engine
            .codec()
            .encode(&Document {
                created_on,
                modified_on,
                data: &item.data,
            })
            .map_err(|err| RepositoryError::Encode {
                key: key.clone(),
                reason: err.to_string(),
            })?;

        let revision = if force {
            session.put(&key, payload).await?
        } else {
            let condition = if item.version == 0 {
                Precondition::CreateRevision(0)
            } else {
                Precondition::ModRevision(item.version)
            };
            let outcome = session.put_if(&key, payload, condition).await?;
            if !outcome.succeeded {
                warn!("Version conflict writing {}", key);
                return Err(RepositoryError::VersionConflict {
                    key,
                    expected: item.version,
                });
            }
            outcome.revision
        };

        debug!("Stored {} at revision {}", key, revision);
        item.version = revision;
        item.created_on = created_on;
        item.modified_on = modified_on;
        item.folder_path = folder_path;
        Ok(revision)
    }

    #[instrument(skip(self))]
    async fn remove_in(&self, folder: Option<&str>, id: &K) -> Result<()> {
        Self::validate_id(id)?;
        let session = self.ready_session().await?;
        let key = self.engine.keys().encode(folder, id);
        let revision = session.delete(&key).await?;
        debug!("Deleted {} at revision {}", key, revision);
        Ok(())
    }

    fn subscribe(&self) -> ChangeReceiver<K, T> {
        self.engine.subscribe()
    }

    fn failed_to_load(&self) -> Vec<String> {
        self.engine.failures().keys()
    }
}

impl<K, T, C> Drop for ConfigRepository<K, T, C> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
