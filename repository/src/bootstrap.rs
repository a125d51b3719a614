//! Finding a healthy store member and opening a session to it.

use async_trait::async_trait;
use std::sync::Arc;
use storage_backend::{KvSession, MemoryStore};
use tracing::{info, instrument, warn};

use crate::config::{ConnectionOptions, DEFAULT_PORT};
use crate::error::{RepositoryError, Result};

/// One answer of an SRV lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    pub target: String,
    pub port: u16,
}

/// Everything needed to dial a single member.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub credentials: Option<(String, String)>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_tls", &self.use_tls)
            .field("username", &self.credentials.as_ref().map(|(user, _)| user))
            .finish()
    }
}

#[async_trait]
pub trait SrvResolver: Send + Sync {
    /// Targets in preference order.
    async fn resolve(&self, hostname: &str) -> Result<Vec<SrvTarget>>;
}

#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn KvSession>>;
}

/// Source of the single session a repository runs on.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn KvSession>>;
}

#[async_trait]
impl SessionFactory for Arc<dyn KvSession> {
    async fn open(&self) -> Result<Arc<dyn KvSession>> {
        Ok(Arc::clone(self))
    }
}

#[async_trait]
impl SessionFactory for MemoryStore {
    async fn open(&self) -> Result<Arc<dyn KvSession>> {
        Ok(Arc::new(self.clone()))
    }
}

pub struct Bootstrapper {
    options: ConnectionOptions,
    resolver: Arc<dyn SrvResolver>,
    connector: Arc<dyn SessionConnector>,
}

impl Bootstrapper {
    pub fn new(
        options: ConnectionOptions,
        resolver: Arc<dyn SrvResolver>,
        connector: Arc<dyn SessionConnector>,
    ) -> Self {
        Self {
            options,
            resolver,
            connector,
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<Arc<dyn KvSession>> {
        if self.options.use_discovery {
            return self.discover().await;
        }

        let host = self.options.host_override().ok_or_else(|| {
            RepositoryError::Bootstrap(
                "dns_host_override must be set when discovery is disabled".to_string(),
            )
        })?;
        let endpoint = Endpoint {
            host: host.to_string(),
            port: self.options.port_override.unwrap_or(DEFAULT_PORT),
            use_tls: self.options.use_tls,
            credentials: self.options.credentials(),
        };
        info!("Connecting to store host {} using port {}", endpoint.host, endpoint.port);
        self.connector
            .connect(&endpoint)
            .await
            .map_err(|err| RepositoryError::Bootstrap(format!("{endpoint:?}: {err}")))
    }

    /// Try every SRV target in order. If none is healthy and TLS has not been
    /// tried, start over once with TLS.
    async fn discover(&self) -> Result<Arc<dyn KvSession>> {
        let mut use_tls = self.options.use_tls;
        loop {
            let hostname = self.options.discovery_hostname(use_tls);
            info!("Attempting service discovery using hostname {}", hostname);

            if let Some(session) = self.first_healthy(&hostname, use_tls).await {
                return Ok(session);
            }

            if use_tls {
                return Err(RepositoryError::Bootstrap(format!(
                    "unable to connect to a store cluster: service discovery via {hostname} found no healthy member"
                )));
            }
            info!("Retrying discovery using TLS");
            use_tls = true;
        }
    }

    async fn first_healthy(&self, hostname: &str, use_tls: bool) -> Option<Arc<dyn KvSession>> {
        let targets = match self.resolver.resolve(hostname).await {
            Ok(targets) => targets,
            Err(err) => {
                warn!("Service discovery lookup for {} failed: {}", hostname, err);
                return None;
            }
        };

        for target in targets {
            let endpoint = Endpoint {
                host: target.target,
                port: self.options.port_override.unwrap_or(target.port),
                use_tls,
                credentials: self.options.credentials(),
            };
            info!("Connecting to store host {} using port {}", endpoint.host, endpoint.port);

            let session = match self.connector.connect(&endpoint).await {
                Ok(session) => session,
                Err(err) => {
                    warn!("Failed to connect to {}:{}: {}", endpoint.host, endpoint.port, err);
                    continue;
                }
            };
            match session.status().await {
                Ok(_) => return Some(session),
                Err(err) => {
                    warn!("Store member {}:{} is unhealthy: {}", endpoint.host, endpoint.port, err);
                }
            }
        }
        None
    }
}

#[async_trait]
impl SessionFactory for Bootstrapper {
    async fn open(&self) -> Result<Arc<dyn KvSession>> {
        self.connect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use storage_backend::StoreError;

    /// Answers SRV lookups from a fixed table.
    struct StaticResolver {
        records: HashMap<String, Vec<SrvTarget>>,
        queries: Mutex<Vec<String>>,
    }

    impl StaticResolver {
        fn new(records: Vec<(&str, Vec<(&str, u16)>)>) -> Self {
            Self {
                records: records
                    .into_iter()
                    .map(|(name, targets)| {
                        let targets = targets
                            .into_iter()
                            .map(|(target, port)| SrvTarget {
                                target: target.to_string(),
                                port,
                            })
                            .collect();
                        (name.to_string(), targets)
                    })
                    .collect(),
                queries: Mutex::new(Vec::new()),
            }
        }

        fn queries(&self) -> Vec<String> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SrvResolver for StaticResolver {
        async fn resolve(&self, hostname: &str) -> Result<Vec<SrvTarget>> {
            self.queries.lock().unwrap().push(hostname.to_string());
            self.records
                .get(hostname)
                .cloned()
                .ok_or_else(|| RepositoryError::Bootstrap(format!("NXDOMAIN {hostname}")))
        }
    }

    /// Hands out in-memory sessions; hosts listed in `unhealthy` fail their
    /// liveness check and hosts in `unreachable` refuse the connection.
    struct FakeConnector {
        unhealthy: Vec<String>,
        unreachable: Vec<String>,
        dialed: Mutex<Vec<Endpoint>>,
    }

    impl FakeConnector {
        fn new(unhealthy: &[&str], unreachable: &[&str]) -> Self {
            Self {
                unhealthy: unhealthy.iter().map(|h| (*h).to_string()).collect(),
                unreachable: unreachable.iter().map(|h| (*h).to_string()).collect(),
                dialed: Mutex::new(Vec::new()),
            }
        }

        fn dialed(&self) -> Vec<Endpoint> {
            self.dialed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SessionConnector for FakeConnector {
        async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn KvSession>> {
            self.dialed.lock().unwrap().push(endpoint.clone());
            if self.unreachable.contains(&endpoint.host) {
                return Err(StoreError::Transport("connection refused".to_string()).into());
            }
            let store = MemoryStore::new();
            if self.unhealthy.contains(&endpoint.host) {
                store.set_healthy(false).await;
            }
            Ok(Arc::new(store))
        }
    }

    fn bootstrapper(
        options: ConnectionOptions,
        resolver: &Arc<StaticResolver>,
        connector: &Arc<FakeConnector>,
    ) -> Bootstrapper {
        Bootstrapper::new(
            options,
            Arc::clone(resolver) as Arc<dyn SrvResolver>,
            Arc::clone(connector) as Arc<dyn SessionConnector>,
        )
    }

    #[tokio::test]
    async fn test_discovery_picks_first_healthy_member() {
        let resolver = Arc::new(StaticResolver::new(vec![(
            "_etcd-client.example.com",
            vec![("etcd-0", 2379), ("etcd-1", 2379), ("etcd-2", 2379)],
        )]));
        let connector = Arc::new(FakeConnector::new(&["etcd-0"], &[]));

        let bootstrapper =
            bootstrapper(ConnectionOptions::discovery("example.com"), &resolver, &connector);
        bootstrapper.connect().await.unwrap();

        let hosts: Vec<_> = connector.dialed().into_iter().map(|e| e.host).collect();
        assert_eq!(hosts, vec!["etcd-0", "etcd-1"]);
    }

    #[tokio::test]
    async fn test_discovery_skips_unreachable_member() {
        let resolver = Arc::new(StaticResolver::new(vec![(
            "_etcd-client.example.com",
            vec![("etcd-0", 2379), ("etcd-1", 4001)],
        )]));
        let connector = Arc::new(FakeConnector::new(&[], &["etcd-0"]));

        let bootstrapper =
            bootstrapper(ConnectionOptions::discovery("example.com"), &resolver, &connector);
        bootstrapper.connect().await.unwrap();

        let last = connector.dialed().pop().unwrap();
        assert_eq!(last.host, "etcd-1");
        assert_eq!(last.port, 4001);
        assert!(!last.use_tls);
    }

    #[tokio::test]
    async fn test_discovery_retries_once_with_tls() {
        let resolver = Arc::new(StaticResolver::new(vec![
            ("_etcd-client.example.com", vec![("etcd-0", 2379)]),
            ("_etcd-client-ssl.example.com", vec![("secure-0", 2379)]),
        ]));
        let connector = Arc::new(FakeConnector::new(&["etcd-0"], &[]));

        let bootstrapper =
            bootstrapper(ConnectionOptions::discovery("example.com"), &resolver, &connector);
        bootstrapper.connect().await.unwrap();

        assert_eq!(
            resolver.queries(),
            vec!["_etcd-client.example.com", "_etcd-client-ssl.example.com"]
        );
        let last = connector.dialed().pop().unwrap();
        assert_eq!(last.host, "secure-0");
        assert!(last.use_tls);
    }

    #[tokio::test]
    async fn test_discovery_fails_after_tls_attempt() {
        let resolver = Arc::new(StaticResolver::new(vec![
            ("_etcd-client.example.com", vec![("etcd-0", 2379)]),
            ("_etcd-client-ssl.example.com", vec![("etcd-0", 2379)]),
        ]));
        let connector = Arc::new(FakeConnector::new(&["etcd-0"], &[]));

        let bootstrapper =
            bootstrapper(ConnectionOptions::discovery("example.com"), &resolver, &connector);
        let result = bootstrapper.connect().await;

        assert!(matches!(result, Err(RepositoryError::Bootstrap(_))));
        assert_eq!(resolver.queries().len(), 2);
    }

    #[tokio::test]
    async fn test_discovery_starting_with_tls_does_not_retry() {
        let resolver = Arc::new(StaticResolver::new(vec![]));
        let connector = Arc::new(FakeConnector::new(&[], &[]));

        let options = ConnectionOptions {
            use_tls: true,
            ..ConnectionOptions::discovery("example.com")
        };
        let result = bootstrapper(options, &resolver, &connector).connect().await;

        assert!(result.is_err());
        assert_eq!(resolver.queries(), vec!["_etcd-client-ssl.example.com"]);
    }

    #[tokio::test]
    async fn test_port_override_replaces_srv_port() {
        let resolver = Arc::new(StaticResolver::new(vec![(
            "_etcd-client.example.com",
            vec![("etcd-0", 2379)],
        )]));
        let connector = Arc::new(FakeConnector::new(&[], &[]));

        let options = ConnectionOptions {
            port_override: Some(12379),
            ..ConnectionOptions::discovery("example.com")
        };
        bootstrapper(options, &resolver, &connector).connect().await.unwrap();

        assert_eq!(connector.dialed()[0].port, 12379);
    }

    #[tokio::test]
    async fn test_direct_connection_uses_default_port_and_credentials() {
        let resolver = Arc::new(StaticResolver::new(vec![]));
        let connector = Arc::new(FakeConnector::new(&[], &[]));

        let options = ConnectionOptions::direct("localhost").with_credentials("root", "secret");
        bootstrapper(options, &resolver, &connector).connect().await.unwrap();

        let dialed = connector.dialed();
        assert_eq!(dialed.len(), 1);
        assert_eq!(dialed[0].host, "localhost");
        assert_eq!(dialed[0].port, DEFAULT_PORT);
        assert_eq!(
            dialed[0].credentials,
            Some(("root".to_string(), "secret".to_string()))
        );
        assert!(resolver.queries().is_empty());
    }

    #[tokio::test]
    async fn test_direct_connection_requires_host() {
        let resolver = Arc::new(StaticResolver::new(vec![]));
        let connector = Arc::new(FakeConnector::new(&[], &[]));

        let options = ConnectionOptions {
            use_discovery: false,
            ..ConnectionOptions::default()
        };
        let result = bootstrapper(options, &resolver, &connector).connect().await;

        assert!(matches!(result, Err(RepositoryError::Bootstrap(_))));
        assert!(connector.dialed().is_empty());
    }
}
