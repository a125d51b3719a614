use async_trait::async_trait;
use bytes::Bytes;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, GetOptions, TlsOptions, Txn, TxnOp,
    WatchOptions,
};
use futures::StreamExt;
use tracing::{debug, instrument, warn};

use crate::error::{Result, StoreError};
use crate::{
    registered, EventType, KeyValue, KvSession, Precondition, RangeResponse, StoreStatus, TxnOutcome,
    WatchBatch, WatchEvent, WatchStream,
};

/// Session to one etcd cluster member.
#[derive(Clone)]
pub struct EtcdSession {
    client: Client,
}

fn transport(err: etcd_client::Error) -> StoreError {
    StoreError::Transport(err.to_string())
}

fn header_revision(header: Option<&etcd_client::ResponseHeader>) -> Result<i64> {
    header
        .map(etcd_client::ResponseHeader::revision)
        .ok_or_else(|| StoreError::Transport("response carried no header".to_string()))
}

fn convert_kv(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: Bytes::copy_from_slice(kv.value()),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
    }
}

fn convert_batch(response: &etcd_client::WatchResponse) -> WatchBatch {
    let events = response
        .events()
        .iter()
        .filter_map(|event| {
            let Some(kv) = event.kv() else {
                warn!("Dropping watch event without a key-value pair");
                return None;
            };
            let kv = convert_kv(kv);
            let event_type = match event.event_type() {
                etcd_client::EventType::Put => EventType::Put,
                etcd_client::EventType::Delete => EventType::Delete,
            };
            Some(WatchEvent { event_type, kv })
        })
        .collect();
    WatchBatch {
        revision: response.header().map_or(0, etcd_client::ResponseHeader::revision),
        events,
    }
}

impl EtcdSession {
    /// Open a session to `host:port`.
    ///
    /// Connecting does not prove the member is healthy; call `status` for that.
    pub async fn connect(
        host: &str,
        port: u16,
        credentials: Option<(String, String)>,
        use_tls: bool,
    ) -> Result<Self> {
        let scheme = if use_tls { "https" } else { "http" };
        let endpoint = format!("{scheme}://{host}:{port}");

        let mut options = ConnectOptions::new();
        if let Some((username, password)) = credentials {
            options = options.with_user(username, password);
        }
        if use_tls {
            options = options.with_tls(TlsOptions::new());
        }

        debug!("Connecting to etcd endpoint {}", endpoint);
        let client = Client::connect([endpoint], Some(options))
            .await
            .map_err(transport)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl KvSession for EtcdSession {
    async fn status(&self) -> Result<StoreStatus> {
        let response = self.client.clone().status().await.map_err(transport)?;
        Ok(StoreStatus {
            revision: header_revision(response.header())?,
        })
    }

    #[instrument(skip(self))]
    async fn range(&self, prefix: &str) -> Result<RangeResponse> {
        let response = self
            .client
            .clone()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(transport)?;
        Ok(RangeResponse {
            revision: header_revision(response.header())?,
            kvs: response.kvs().iter().map(convert_kv).collect(),
        })
    }

    #[instrument(skip(self))]
    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(start_revision);
        let (watcher, stream) = self
            .client
            .clone()
            .watch(prefix, Some(options))
            .await
            .map_err(transport)?;

        // The watcher rides along in the stream state; dropping it cancels the watch.
        let batches = futures::stream::unfold(
            Some((watcher, stream)),
            |state| async move {
                let (watcher, mut stream) = state?;
                match stream.message().await {
                    Ok(Some(response)) if response.canceled() => Some((
                        Err(StoreError::WatchCanceled(response.cancel_reason().to_string())),
                        None,
                    )),
                    Ok(Some(response)) => {
                        Some((Ok(convert_batch(&response)), Some((watcher, stream))))
                    }
                    Ok(None) => None,
                    Err(err) => Some((Err(transport(err)), None)),
                }
            },
        );
        // `Client::watch` has already consumed the created response.
        Ok(registered(start_revision, batches.boxed()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64> {
        let response = self
            .client
            .clone()
            .put(key, value, None)
            .await
            .map_err(transport)?;
        header_revision(response.header())
    }

    async fn put_if(
        &self,
        key: &str,
        value: Vec<u8>,
        condition: Precondition,
    ) -> Result<TxnOutcome> {
        let compare = match condition {
            Precondition::CreateRevision(revision) => {
                Compare::create_revision(key, CompareOp::Equal, revision)
            }
            Precondition::ModRevision(revision) => {
                Compare::mod_revision(key, CompareOp::Equal, revision)
            }
        };
        let txn = Txn::new()
            .when([compare])
            .and_then([TxnOp::put(key, value, None)]);
        let response = self.client.clone().txn(txn).await.map_err(transport)?;
        Ok(TxnOutcome {
            succeeded: response.succeeded(),
            revision: header_revision(response.header())?,
        })
    }

    async fn delete(&self, key: &str) -> Result<i64> {
        let response = self
            .client
            .clone()
            .delete(key, None)
            .await
            .map_err(transport)?;
        header_revision(response.header())
    }
}
