#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

/// Root namespace a repository's records live under.
///
/// Global and datacenter-local trees never share a key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Available in every datacenter.
    #[default]
    Global,
    /// Available only in the datacenter it was written to.
    Local,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Local => "local",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity type of a configuration record.
///
/// An id is written into the store key through `Display` and read back with
/// `FromStr`. The `Default` value is reserved to mean "unset".
pub trait RecordId:
    Clone + Eq + Hash + Default + fmt::Display + fmt::Debug + FromStr + Send + Sync + 'static
{
    fn is_unset(&self) -> bool {
        *self == Self::default()
    }
}

impl<T> RecordId for T where
    T: Clone + Eq + Hash + Default + fmt::Display + fmt::Debug + FromStr + Send + Sync + 'static
{
}

/// A typed configuration record plus the identity and version metadata the
/// repository derives from the store.
///
/// `id`, `folder_path` and `version` come from the store key and revision and
/// are never part of the serialized value.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigItem<K, T> {
    pub id: K,
    pub folder_path: Option<String>,
    /// Store modification revision; `0` means the record was never persisted.
    pub version: i64,
    pub created_on: DateTime<Utc>,
    pub modified_on: Option<DateTime<Utc>>,
    pub data: T,
}

impl<K, T> ConfigItem<K, T> {
    pub fn new(id: K, data: T) -> Self {
        Self {
            id,
            folder_path: None,
            version: 0,
            created_on: Utc::now(),
            modified_on: None,
            data,
        }
    }

    pub fn in_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder_path = Some(folder.into());
        self
    }

    pub fn is_persisted(&self) -> bool {
        self.version != 0
    }
}

/// A record that disappeared from the store.
///
/// `previous` is the last value the mirror held. It is `None` when the
/// mirror never saw the record, in which case only the identity is known.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedItem<K, T> {
    pub id: K,
    pub folder_path: Option<String>,
    pub previous: Option<ConfigItem<K, T>>,
}

/// Everything one watch batch changed, published as a single notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet<K, T> {
    pub updated: Vec<ConfigItem<K, T>>,
    pub removed: Vec<RemovedItem<K, T>>,
}

impl<K, T> Default for ChangeSet<K, T> {
    fn default() -> Self {
        Self {
            updated: Vec::new(),
            removed: Vec::new(),
        }
    }
}

impl<K, T> ChangeSet<K, T> {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }
}

impl<K: PartialEq, T> ChangeSet<K, T> {
    pub fn updated_item(&self, id: &K) -> Option<&ConfigItem<K, T>> {
        self.updated.iter().find(|item| item.id == *id)
    }

    pub fn removed_item(&self, id: &K) -> Option<&RemovedItem<K, T>> {
        self.removed.iter().find(|item| item.id == *id)
    }
}
