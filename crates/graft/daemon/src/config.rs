//! Configuration for the graft daemon.

use graft_sync::SyncConfig;
use serde::{Deserialize, Serialize};

/// Main daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraftConfig {
    /// Mirror database backend.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Workspace-local tracking server, the source being watched.
    #[serde(default = "default_local_endpoint")]
    pub local: TrackingEndpoint,

    /// Cluster-wide tracking server, the push target.
    #[serde(default = "default_remote_endpoint")]
    pub remote: TrackingEndpoint,

    /// Experiment stage settings.
    #[serde(default)]
    pub experiments: SyncConfig,

    /// Run stage settings.
    #[serde(default)]
    pub runs: SyncConfig,

    /// Metric stage settings.
    #[serde(default)]
    pub metrics: SyncConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for GraftConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            local: default_local_endpoint(),
            remote: default_remote_endpoint(),
            experiments: SyncConfig::default(),
            runs: SyncConfig::default(),
            metrics: SyncConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Storage backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (for development/testing)
    Memory,

    /// PostgreSQL storage
    Postgres {
        /// Connection URL
        url: String,

        /// Maximum connections in pool
        #[serde(default = "default_pool_size")]
        max_connections: u32,

        /// Connection timeout in seconds
        #[serde(default = "default_connection_timeout")]
        connect_timeout_secs: u64,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

/// One tracking server endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingEndpoint {
    /// Base URL, scheme and authority only.
    pub url: String,

    /// Bearer token attached to every request when set.
    #[serde(default)]
    pub bearer_token: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// Default value helpers
fn default_local_endpoint() -> TrackingEndpoint {
    TrackingEndpoint {
        url: "http://127.0.0.1:5000".to_string(),
        bearer_token: None,
    }
}

fn default_remote_endpoint() -> TrackingEndpoint {
    TrackingEndpoint {
        url: "http://127.0.0.1:5001".to_string(),
        bearer_token: None,
    }
}

fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GraftConfig {
    /// Load configuration from file
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default configuration
        builder = builder.add_source(config::Config::try_from(&GraftConfig::default())?);

        // Add file configuration if provided
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // Add environment variables with GRAFT_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("GRAFT")
                .separator("_")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GraftConfig::default();
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert_eq!(config.local.url, "http://127.0.0.1:5000");
        assert_eq!(config.remote.url, "http://127.0.0.1:5001");
        assert!(config.experiments.enabled);
        assert!(!config.logging.json);
    }

    #[test]
    fn test_storage_tagged_form() {
        let parsed: StorageConfig = serde_json::from_value(serde_json::json!({
            "type": "postgres",
            "url": "postgres://graft@localhost/graft",
        }))
        .unwrap();
        match parsed {
            StorageConfig::Postgres {
                url,
                max_connections,
                connect_timeout_secs,
            } => {
                assert_eq!(url, "postgres://graft@localhost/graft");
                assert_eq!(max_connections, 10);
                assert_eq!(connect_timeout_secs, 5);
            }
            StorageConfig::Memory => panic!("expected the postgres variant"),
        }
    }

    #[test]
    fn test_load_without_file() {
        let config = GraftConfig::load(None).unwrap();
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert_eq!(config.runs.resync_frequency_secs, 15);
    }
}
