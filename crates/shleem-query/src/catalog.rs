//! Top-level context owning the driver, credentials and caches

use crate::cache::{BoundedCache, ConnectionCache};
use crate::config::CatalogConfig;
use crate::credentials::CredentialStore;
use crate::driver::Driver;
use crate::error::{Result, TapError};
use crate::identifier::split_path;
use crate::source::{Server, Source};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Name and identifier of an ancestor node
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NodeRef {
    pub(crate) name: String,
    pub(crate) identifier: String,
}

/// State shared by every node of one source tree
pub(crate) struct Context<D: Driver> {
    pub(crate) driver: D,
    pub(crate) credentials: CredentialStore,
    pub(crate) connections: ConnectionCache<D>,
    pub(crate) config: CatalogConfig,
}

impl<D: Driver> Context<D> {
    pub(crate) async fn server_handle(&self, identifier: &str, name: &str) -> Result<D::Server> {
        self.connections
            .server(identifier, || async {
                let credentials = self.credentials.get(name)?;
                info!(
                    "Connecting to {} server {} at {}",
                    self.driver.backend(),
                    name,
                    credentials.redacted()
                );
                self.driver.connect(name, credentials).await
            })
            .await
    }

    pub(crate) async fn database_handle(
        &self,
        server: &NodeRef,
        database: &NodeRef,
    ) -> Result<D::Database> {
        self.connections
            .database(&database.identifier, || async {
                let server = self.server_handle(&server.identifier, &server.name).await?;
                Ok(self.driver.database(&server, &database.name))
            })
            .await
    }

    pub(crate) async fn collection_handle(
        &self,
        server: &NodeRef,
        database: &NodeRef,
        collection: &NodeRef,
    ) -> Result<D::Collection> {
        self.connections
            .collection(&collection.identifier, || async {
                let database = self.database_handle(server, database).await?;
                Ok(self.driver.collection(&database, &collection.name))
            })
            .await
    }
}

/// Entry point of a source tree
///
/// Servers obtained from the same catalog share its connection cache;
/// asking twice for the same server name returns the same node.
pub struct Catalog<D: Driver> {
    ctx: Arc<Context<D>>,
    servers: Mutex<BoundedCache<String, Arc<Server<D>>>>,
}

impl<D: Driver> Catalog<D> {
    pub fn new(driver: D, credentials: CredentialStore, config: CatalogConfig) -> Self {
        let connections = ConnectionCache::new(
            config.server_capacity,
            config.database_capacity,
            config.collection_capacity,
        );
        let servers = Mutex::new(BoundedCache::new(config.node_capacity));
        Self {
            ctx: Arc::new(Context {
                driver,
                credentials,
                connections,
                config,
            }),
            servers,
        }
    }

    /// Build a catalog reading credentials from the configured directory
    pub fn from_config(driver: D, config: CatalogConfig) -> Result<Self> {
        let credentials = CredentialStore::load_default(&config)?;
        Ok(Self::new(driver, credentials, config))
    }

    pub fn driver(&self) -> &D {
        &self.ctx.driver
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.ctx.credentials
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.ctx.config
    }

    pub fn connections(&self) -> &ConnectionCache<D> {
        &self.ctx.connections
    }

    /// Server node with the given name, created on first request
    pub fn server(&self, name: &str) -> Arc<Server<D>> {
        let mut servers = self.servers.lock();
        if let Some(server) = servers.get(name) {
            return server.clone();
        }

        let server = Arc::new(Server::new(self.ctx.clone(), name));
        if let Some((_, evicted)) = servers.insert(name.to_string(), server.clone()) {
            debug!("Evicted server node {}", evicted.name());
            self.ctx.connections.invalidate(evicted.name());
        }
        server
    }

    /// Driver connection of the named server, opened on first use
    pub async fn connect(&self, server: &str) -> Result<D::Server> {
        self.server(server).connect().await
    }

    /// One server node per entry of the credential store
    pub fn configured_servers(&self) -> Vec<Arc<Server<D>>> {
        let names: Vec<String> = self
            .ctx
            .credentials
            .server_names()
            .map(str::to_string)
            .collect();
        names.iter().map(|name| self.server(name)).collect()
    }

    /// Resolve a dotted `server[.database[.collection]]` path
    ///
    /// Equivalent to calling the explicit factories in sequence.
    pub fn source(&self, path: &str) -> Result<Source<D>> {
        let segments = split_path(path);
        if segments.iter().any(|s| s.is_empty()) {
            return Err(TapError::InvalidPath(format!("empty segment in '{}'", path)));
        }

        match segments.as_slice() {
            [server] => Ok(Source::Server(self.server(server))),
            [server, database] => Ok(Source::Database(self.server(server).database(database))),
            [server, database, collection] => Ok(Source::Collection(
                self.server(server).database(database).collection(collection),
            )),
            _ => Err(TapError::InvalidPath(format!(
                "'{}' has {} segments; paths address servers, databases and collections only",
                path,
                segments.len()
            ))),
        }
    }
}
