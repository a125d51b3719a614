use anyhow::{Context, Result};
use config_repository::{
    Bootstrapper, ConfigRepository, ConfigurationRepository, ConnectionOptions, RepositoryOptions,
    Scope,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let connection = ConnectionOptions::from_env()?;
    info!("Connecting with {:?}", connection);

    let scope = match std::env::var("CONFIG_SCOPE").as_deref() {
        Ok("local") => Scope::Local,
        Ok("global") | Err(_) => Scope::Global,
        Ok(other) => anyhow::bail!("CONFIG_SCOPE must be 'global' or 'local', got {other:?}"),
    };
    let type_name = std::env::var("CONFIG_TYPE").context("CONFIG_TYPE is required")?;
    let options = RepositoryOptions::new(scope, type_name);

    let bootstrapper = Bootstrapper::etcd(connection)?;
    let repository: ConfigRepository<String, serde_json::Value> =
        ConfigRepository::with_json(options, bootstrapper);
    let mut changes = repository.subscribe();
    repository.wait_till_ready().await?;

    for item in repository.get_all().await? {
        info!(
            "{} (folder {:?}, version {}): {}",
            item.id, item.folder_path, item.version, item.data
        );
    }
    for key in repository.failed_to_load() {
        warn!("Could not load {}", key);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
            received = changes.recv() => match received {
                Ok(change_set) => {
                    for item in &change_set.updated {
                        info!("Updated {} to version {}: {}", item.id, item.version, item.data);
                    }
                    for removed in &change_set.removed {
                        info!("Removed {} (folder {:?})", removed.id, removed.folder_path);
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} change sets", skipped),
                Err(RecvError::Closed) => anyhow::bail!("change feed closed"),
            },
        }
    }
}
