use dashmap::DashMap;
use shared_types::ConfigItem;

/// Latest decoded record per canonical key.
///
/// Entries are sharded, so writers to different keys never contend and a
/// reader only ever sees whole records.
#[derive(Debug)]
pub struct LocalMirror<K, T> {
    entries: DashMap<String, ConfigItem<K, T>>,
}

impl<K, T> Default for LocalMirror<K, T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<K, T> LocalMirror<K, T>
where
    K: Clone,
    T: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<ConfigItem<K, T>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Overwrite the entry, returning the previous record.
    pub fn upsert(&self, key: &str, item: ConfigItem<K, T>) -> Option<ConfigItem<K, T>> {
        self.entries.insert(key.to_string(), item)
    }

    pub fn remove(&self, key: &str) -> Option<ConfigItem<K, T>> {
        self.entries.remove(key).map(|(_, item)| item)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Snapshot of all records. Each record is consistent on its own; the set
    /// as a whole may interleave with concurrent updates.
    pub fn values(&self) -> Vec<ConfigItem<K, T>> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
