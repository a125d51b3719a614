//! Stored value format.
//!
//! The value holds the timestamps and the record payload. Identity, folder and
//! version are derived from the key and the store revision, so they are never
//! written.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CodecError(pub String);

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        Self(err.to_string())
    }
}

/// Everything a stored value carries.
///
/// The payload is flattened into the document. A payload that is an
/// internally tagged enum therefore leaves its tag beside the timestamps, and
/// decoding picks the variant from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document<T> {
    #[serde(default = "Utc::now")]
    pub created_on: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_on: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub data: T,
}

pub trait DocumentCodec<T>: Send + Sync + 'static {
    fn encode(&self, document: &Document<&T>) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Document<T>, CodecError>;
}

/// Compact camelCase JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> DocumentCodec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self, document: &Document<&T>) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(document)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Document<T>, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
