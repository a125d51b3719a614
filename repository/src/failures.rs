use dashmap::DashSet;

/// Keys whose latest value could not be decoded.
#[derive(Debug, Default)]
pub struct FailureSet {
    keys: DashSet<String>,
}

impl FailureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the key was not already marked.
    pub fn insert(&self, key: &str) -> bool {
        self.keys.insert(key.to_string())
    }

    /// Returns `true` if the key was marked.
    pub fn remove(&self, key: &str) -> bool {
        self.keys.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Sorted copy of the failed keys.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.keys.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_insert_and_remove() {
        let failures = FailureSet::new();
        assert!(failures.is_empty());

        assert!(failures.insert("/global/item/a"));
        assert!(!failures.insert("/global/item/a"));
        assert!(failures.contains("/global/item/a"));
        assert_eq!(failures.len(), 1);

        assert!(failures.remove("/global/item/a"));
        assert!(!failures.remove("/global/item/a"));
        assert!(failures.is_empty());
    }

    #[test]
    fn test_keys_are_sorted() {
        let failures = FailureSet::new();
        failures.insert("/g/t/c");
        failures.insert("/g/t/a");
        failures.insert("/g/t/b");

        assert_eq!(failures.keys(), vec!["/g/t/a", "/g/t/b", "/g/t/c"]);
    }

    #[tokio::test]
    async fn test_concurrent_inserts() {
        let failures = Arc::new(FailureSet::new());
        let mut handles = Vec::new();

        for task in 0..8 {
            let failures = Arc::clone(&failures);
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    failures.insert(&format!("/g/t/{task}-{i}"));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(failures.len(), 400);
    }
}
