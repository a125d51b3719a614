//! Typed configuration repository over a revisioned key-value store.
//!
//! A repository keeps every record of one scope and type in a local mirror,
//! loaded from a snapshot and kept current by a prefix watch. Reads are served
//! from the mirror. Writes are conditional on the record's version unless
//! forced, and reach the mirror through the same watch as everyone else's.
//!
//! ```no_run
//! # async fn demo() -> config_repository::Result<()> {
//! use config_repository::{
//!     ConfigItem, ConfigRepository, ConfigurationRepository, MemoryStore, RepositoryOptions, Scope,
//! };
//!
//! let repository: ConfigRepository<String, serde_json::Value> =
//!     ConfigRepository::with_json(RepositoryOptions::new(Scope::Global, "feature"), MemoryStore::new());
//! repository.wait_till_ready().await?;
//!
//! let mut item = ConfigItem::new("dark-mode".to_string(), serde_json::json!({ "enabled": true }));
//! repository.set(&mut item, false).await?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod bootstrap;
pub mod codec;
pub mod config;
#[cfg(feature = "etcd")]
pub mod discovery;
pub mod error;
pub mod failures;
pub mod key;
pub mod mirror;
pub mod repository;
pub mod sync;

pub use bootstrap::{Bootstrapper, Endpoint, SessionConnector, SessionFactory, SrvResolver, SrvTarget};
pub use codec::{CodecError, Document, DocumentCodec, JsonCodec};
pub use config::{ConnectionOptions, RepositoryOptions, DEFAULT_PORT};
#[cfg(feature = "etcd")]
pub use discovery::{DnsSrvResolver, EtcdConnector};
pub use error::{RepositoryError, Result};
pub use failures::FailureSet;
pub use key::KeyCodec;
pub use mirror::LocalMirror;
pub use repository::{ConfigRepository, ConfigurationRepository};
pub use sync::{ChangeReceiver, SyncEngine, SyncState};

pub use shared_types::{ChangeSet, ConfigItem, RecordId, RemovedItem, Scope};
pub use storage_backend::{KvSession, MemoryStore, StoreError};
