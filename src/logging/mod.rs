//! Logging setup: console output plus optional persisted history.
//!
//! ```ignore
//! let store = Arc::new(LogStore::new(storage, 500, 24));
//! logging::init(&config.logging, Some(store.clone()))?;
//! let cleanup = logging::spawn_cleanup(store, Duration::from_secs(300));
//! ```

pub mod layer;

pub use layer::{spawn_cleanup, LogEntry, LogStore, StorageLogLayer};

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::str::FromStr;
use std::sync::Arc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` overrides `config.level`.
///
/// When `store` is given and `config.persist` is set, events at or above
/// `config.persist_level` are also written to durable storage.
pub fn init(config: &LoggingConfig, store: Option<Arc<LogStore>>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("Invalid log filter: {}", config.level))?;

    let persisted = match store {
        Some(store) if config.persist => {
            let level = tracing::Level::from_str(&config.persist_level)
                .map_err(|_| anyhow::anyhow!("Invalid persist_level: {}", config.persist_level))?;
            Some(StorageLogLayer::new(store, level))
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(config.ansi)
                .with_target(false),
        )
        .with(persisted)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn init_rejects_bad_persist_level() {
        let config = LoggingConfig {
            persist_level: "loud".into(),
            ..LoggingConfig::default()
        };
        let store = Arc::new(LogStore::new(Arc::new(MemoryStorage::new()), 10, 24));
        let err = init(&config, Some(store)).unwrap_err();
        assert!(err.to_string().contains("persist_level"));
    }
}
