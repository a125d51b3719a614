//! Canonical store keys: `/{scope}/{type-name}[/{folder...}]/{id}`.

use shared_types::{RecordId, Scope};
use std::fmt::Display;

use crate::error::{RepositoryError, Result};

pub const SEPARATOR: char = '/';

/// Strip surrounding separators and give the folder a single leading `/`.
///
/// Empty folders and `/` normalize to `None`, the root.
pub fn normalize_folder(folder: Option<&str>) -> Option<String> {
    let trimmed = folder?.trim_matches(SEPARATOR);
    if trimmed.is_empty() {
        None
    } else {
        Some(format!("{SEPARATOR}{trimmed}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    prefix: String,
}

impl KeyCodec {
    pub fn new(scope: Scope, type_name: &str) -> Self {
        Self {
            prefix: format!("{SEPARATOR}{scope}{SEPARATOR}{}", type_name.to_lowercase()),
        }
    }

    /// `/{scope}/{type-name}`, without a trailing separator.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefix covering every record key and nothing else.
    pub fn watch_prefix(&self) -> String {
        format!("{}{SEPARATOR}", self.prefix)
    }

    pub fn encode<K: Display>(&self, folder: Option<&str>, id: &K) -> String {
        match normalize_folder(folder) {
            Some(folder) => format!("{}{folder}{SEPARATOR}{id}", self.prefix),
            None => format!("{}{SEPARATOR}{id}", self.prefix),
        }
    }

    /// Recover `(id, folder)` from a canonical key.
    pub fn decode<K: RecordId>(&self, key: &str) -> Result<(K, Option<String>)> {
        Ok((self.decode_id(key)?, self.decode_folder(key)?))
    }

    pub fn decode_id<K: RecordId>(&self, key: &str) -> Result<K> {
        let relative = self.relative(key)?;
        let segment = relative
            .rsplit(SEPARATOR)
            .next()
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| key_error(key, "missing id segment"))?;

        segment.parse::<K>().map_err(|_| {
            key_error(
                key,
                &format!(
                    "cannot convert {segment:?} to {}",
                    std::any::type_name::<K>()
                ),
            )
        })
    }

    /// Folder between the prefix and the id, or `None` for root records.
    pub fn decode_folder(&self, key: &str) -> Result<Option<String>> {
        let relative = self.relative(key)?;
        Ok(relative
            .rsplit_once(SEPARATOR)
            .map(|(folder, _)| format!("{SEPARATOR}{folder}")))
    }

    fn relative<'a>(&self, key: &'a str) -> Result<&'a str> {
        key.strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix(SEPARATOR))
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| key_error(key, &format!("not under prefix {}", self.prefix)))
    }
}

fn key_error(key: &str, reason: &str) -> RepositoryError {
    RepositoryError::KeyDecode {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
