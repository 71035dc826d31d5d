//! Catalog configuration

use std::path::PathBuf;

/// Environment variable overriding the configuration directory
pub const CONFIG_DIR_ENV: &str = "SHLEEM_DIR";
pub const CONFIG_DIR_NAME: &str = ".shleem";

pub const DEFAULT_CONNECTION_CAPACITY: usize = 2;
pub const DEFAULT_NODE_CAPACITY: usize = 1024;

/// Sizing and location settings for a [`Catalog`](crate::Catalog)
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// Directory holding the credential file
    pub config_dir: PathBuf,
    /// Cached server connections
    pub server_capacity: usize,
    /// Cached database handles
    pub database_capacity: usize,
    /// Cached collection handles
    pub collection_capacity: usize,
    /// Memoized child nodes per parent (and servers per catalog)
    pub node_capacity: usize,
}

impl CatalogConfig {
    pub fn new() -> Self {
        Self {
            config_dir: default_config_dir(),
            server_capacity: DEFAULT_CONNECTION_CAPACITY,
            database_capacity: DEFAULT_CONNECTION_CAPACITY,
            collection_capacity: DEFAULT_CONNECTION_CAPACITY,
            node_capacity: DEFAULT_NODE_CAPACITY,
        }
    }

    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = dir.into();
        self
    }

    pub fn with_server_capacity(mut self, capacity: usize) -> Self {
        self.server_capacity = capacity;
        self
    }

    pub fn with_database_capacity(mut self, capacity: usize) -> Self {
        self.database_capacity = capacity;
        self
    }

    pub fn with_collection_capacity(mut self, capacity: usize) -> Self {
        self.collection_capacity = capacity;
        self
    }

    pub fn with_node_capacity(mut self, capacity: usize) -> Self {
        self.node_capacity = capacity;
        self
    }

    /// Full path of the credential file inside the config directory
    pub fn credentials_path(&self) -> PathBuf {
        self.config_dir
            .join(crate::credentials::CREDENTIALS_FILE_NAME)
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// `$SHLEEM_DIR` if set, otherwise `~/.shleem`
pub fn default_config_dir() -> PathBuf {
    std::env::var(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(CONFIG_DIR_NAME)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = CatalogConfig::new().with_config_dir("/tmp/shleem-test");
        assert_eq!(config.server_capacity, 2);
        assert_eq!(config.database_capacity, 2);
        assert_eq!(config.collection_capacity, 2);
        assert_eq!(config.node_capacity, 1024);
        assert_eq!(
            config.credentials_path(),
            PathBuf::from("/tmp/shleem-test/mongodb_credentials.json")
        );
    }

    #[test]
    fn test_config_builder() {
        let config = CatalogConfig::new()
            .with_server_capacity(8)
            .with_database_capacity(4)
            .with_collection_capacity(16)
            .with_node_capacity(3);
        assert_eq!(config.server_capacity, 8);
        assert_eq!(config.database_capacity, 4);
        assert_eq!(config.collection_capacity, 16);
        assert_eq!(config.node_capacity, 3);
    }
}
