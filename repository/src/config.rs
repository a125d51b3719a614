use serde::{Deserialize, Serialize};
use shared_types::Scope;
use std::fmt;

/// Client port etcd members listen on unless told otherwise.
pub const DEFAULT_PORT: u16 = 2379;

const DEFAULT_CHANGE_BUFFER: usize = 256;

/// Where a repository's records live and how its notifications are buffered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryOptions {
    pub scope: Scope,
    /// Type namespace segment of every key; lowercased when keys are built.
    pub type_name: String,
    /// Notifications a slow subscriber may fall behind before it starts
    /// missing batches.
    #[serde(default = "default_change_buffer")]
    pub change_buffer: usize,
}

fn default_change_buffer() -> usize {
    DEFAULT_CHANGE_BUFFER
}

impl RepositoryOptions {
    pub fn new(scope: Scope, type_name: impl Into<String>) -> Self {
        Self {
            scope,
            type_name: type_name.into(),
            change_buffer: DEFAULT_CHANGE_BUFFER,
        }
    }

    /// Name the namespace after `T`'s unqualified type name.
    pub fn for_type<T: ?Sized>(scope: Scope) -> Self {
        Self::new(scope, short_type_name::<T>().to_lowercase())
    }

    pub fn with_change_buffer(mut self, change_buffer: usize) -> Self {
        self.change_buffer = change_buffer.max(1);
        self
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
}

/// How to find and authenticate to the store cluster.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Look members up through the `_etcd-client` SRV record; otherwise
    /// connect straight to `dns_host_override`.
    pub use_discovery: bool,
    pub discovery_domain: String,
    /// With discovery: the SRV name to query. Without: the host to dial.
    pub dns_host_override: Option<String>,
    /// Replaces the SRV port, or `DEFAULT_PORT` for direct connections.
    pub port_override: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            use_discovery: true,
            discovery_domain: String::new(),
            dns_host_override: None,
            port_override: None,
            username: None,
            password: None,
            use_tls: false,
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("use_discovery", &self.use_discovery)
            .field("discovery_domain", &self.discovery_domain)
            .field("dns_host_override", &self.dns_host_override)
            .field("port_override", &self.port_override)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

impl ConnectionOptions {
    /// Direct connection to a single host, skipping discovery.
    pub fn direct(host: impl Into<String>) -> Self {
        Self {
            use_discovery: false,
            dns_host_override: Some(host.into()),
            ..Self::default()
        }
    }

    pub fn discovery(domain: impl Into<String>) -> Self {
        Self {
            discovery_domain: domain.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// SRV name queried during discovery.
    pub fn discovery_hostname(&self, use_tls: bool) -> String {
        match self.host_override() {
            Some(host) => host.to_string(),
            None => {
                let suffix = if use_tls { "-ssl" } else { "" };
                format!("_etcd-client{suffix}.{}", self.discovery_domain)
            }
        }
    }

    pub fn host_override(&self) -> Option<&str> {
        self.dns_host_override
            .as_deref()
            .filter(|host| !host.is_empty())
    }

    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some((username.clone(), password.clone())),
            (Some(username), None) => Some((username.clone(), String::new())),
            _ => None,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let use_discovery = match std::env::var("ETCD_DISCOVERY") {
            Ok(value) => value
                .parse::<bool>()
                .map_err(|_| anyhow::anyhow!("ETCD_DISCOVERY must be 'true' or 'false', got {value:?}"))?,
            Err(_) => defaults.use_discovery,
        };

        let port_override = match std::env::var("ETCD_PORT") {
            Ok(value) => Some(
                value
                    .parse::<u16>()
                    .map_err(|_| anyhow::anyhow!("ETCD_PORT must be a port number, got {value:?}"))?,
            ),
            Err(_) => None,
        };

        let use_tls = std::env::var("ETCD_USE_TLS")
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        let options = Self {
            use_discovery,
            discovery_domain: std::env::var("ETCD_DISCOVERY_DOMAIN").unwrap_or_default(),
            dns_host_override: std::env::var("ETCD_HOST").ok(),
            port_override,
            username: std::env::var("ETCD_USERNAME").ok(),
            password: std::env::var("ETCD_PASSWORD").ok(),
            use_tls,
        };

        if !options.use_discovery && options.host_override().is_none() {
            anyhow::bail!("ETCD_HOST is required when ETCD_DISCOVERY is false");
        }

        Ok(options)
    }
}
