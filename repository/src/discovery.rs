//! DNS SRV resolution and etcd sessions for `Bootstrapper`.

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use std::sync::Arc;
use storage_backend::{EtcdSession, KvSession};
use tracing::{debug, warn};

use crate::bootstrap::{Bootstrapper, Endpoint, SessionConnector, SrvResolver, SrvTarget};
use crate::config::ConnectionOptions;
use crate::error::{RepositoryError, Result};

/// Resolves SRV records with the system's resolver configuration.
pub struct DnsSrvResolver {
    resolver: TokioAsyncResolver,
}

impl DnsSrvResolver {
    pub fn from_system_conf() -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|err| RepositoryError::Bootstrap(format!("DNS resolver: {err}")))?;
        Ok(Self { resolver })
    }
}

#[async_trait]
impl SrvResolver for DnsSrvResolver {
    async fn resolve(&self, hostname: &str) -> Result<Vec<SrvTarget>> {
        let lookup = match self.resolver.srv_lookup(hostname).await {
            Ok(lookup) => lookup,
            Err(err) => {
                warn!("SRV lookup for {} failed: {}", hostname, err);
                return Ok(Vec::new());
            }
        };

        let mut records: Vec<_> = lookup.iter().collect();
        records.sort_by_key(|srv| (srv.priority(), std::cmp::Reverse(srv.weight())));

        let targets: Vec<SrvTarget> = records
            .into_iter()
            .map(|srv| SrvTarget {
                target: srv.target().to_utf8().trim_end_matches('.').to_string(),
                port: srv.port(),
            })
            .collect();
        debug!("SRV lookup for {} returned {} targets", hostname, targets.len());
        Ok(targets)
    }
}

/// Opens `EtcdSession`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct EtcdConnector;

#[async_trait]
impl SessionConnector for EtcdConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn KvSession>> {
        let session = EtcdSession::connect(
            &endpoint.host,
            endpoint.port,
            endpoint.credentials.clone(),
            endpoint.use_tls,
        )
        .await?;
        Ok(Arc::new(session))
    }
}

impl Bootstrapper {
    /// Bootstrapper backed by system DNS and the etcd client.
    pub fn etcd(options: ConnectionOptions) -> Result<Self> {
        Ok(Self::new(
            options,
            Arc::new(DnsSrvResolver::from_system_conf()?),
            Arc::new(EtcdConnector),
        ))
    }
}
