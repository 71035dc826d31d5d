//! Addressable nodes of the source tree
//!
//! A tree is built top-down: server, database, collection. Child factories
//! are memoized per parent, so navigating to the same name twice yields the
//! same `Arc`. Queries and aggregations hang off collections and are the
//! only tappable nodes.

use crate::cache::BoundedCache;
use crate::catalog::{Context, NodeRef};
use crate::driver::Driver;
use crate::error::Result;
use crate::identifier::compose;
use crate::tap::{Aggregation, Query, Tappable};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Backend name used by sources that are not bound to a driver
pub const DEFAULT_BACKEND: &str = "unspecified";

/// Category of a source
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Server,
    Database,
    Collection,
    Query,
    Aggregation,
    Generic,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Server => write!(f, "server"),
            SourceKind::Database => write!(f, "database"),
            SourceKind::Collection => write!(f, "collection"),
            SourceKind::Query => write!(f, "query"),
            SourceKind::Aggregation => write!(f, "aggregation"),
            SourceKind::Generic => write!(f, "generic"),
        }
    }
}

/// Core trait implemented by every node
pub trait DataSource: Send + Sync {
    /// Dotted identifier, unique within one tree
    fn identifier(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Name of the backend serving this source
    fn backend(&self) -> &str;
}

pub(crate) fn describe(source: &dyn DataSource, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
        f,
        "{} {} source: {}",
        source.backend(),
        source.kind(),
        source.identifier()
    )
}

/// A source defined by the caller rather than by a driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericSource {
    identifier: String,
    backend: String,
}

impl GenericSource {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            backend: DEFAULT_BACKEND.to_string(),
        }
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }
}

impl DataSource for GenericSource {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Generic
    }

    fn backend(&self) -> &str {
        &self.backend
    }
}

impl fmt::Display for GenericSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        describe(self, f)
    }
}

/// Any driver-backed node
pub enum Source<D: Driver> {
    Server(Arc<Server<D>>),
    Database(Arc<Database<D>>),
    Collection(Arc<Collection<D>>),
    Query(Arc<Query<D>>),
    Aggregation(Arc<Aggregation<D>>),
}

impl<D: Driver> Source<D> {
    fn inner(&self) -> &dyn DataSource {
        match self {
            Source::Server(s) => &**s,
            Source::Database(d) => &**d,
            Source::Collection(c) => &**c,
            Source::Query(q) => &**q,
            Source::Aggregation(a) => &**a,
        }
    }

    /// The tappable capability, for queries and aggregations only
    pub fn as_tap(&self) -> Option<&dyn Tappable> {
        match self {
            Source::Query(q) => Some(&**q),
            Source::Aggregation(a) => Some(&**a),
            _ => None,
        }
    }

    pub fn as_server(&self) -> Option<&Arc<Server<D>>> {
        match self {
            Source::Server(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_database(&self) -> Option<&Arc<Database<D>>> {
        match self {
            Source::Database(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&Arc<Collection<D>>> {
        match self {
            Source::Collection(c) => Some(c),
            _ => None,
        }
    }
}

impl<D: Driver> DataSource for Source<D> {
    fn identifier(&self) -> &str {
        self.inner().identifier()
    }

    fn kind(&self) -> SourceKind {
        self.inner().kind()
    }

    fn backend(&self) -> &str {
        self.inner().backend()
    }
}

impl<D: Driver> fmt::Display for Source<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        describe(self.inner(), f)
    }
}

impl<D: Driver> Clone for Source<D> {
    fn clone(&self) -> Self {
        match self {
            Source::Server(s) => Source::Server(s.clone()),
            Source::Database(d) => Source::Database(d.clone()),
            Source::Collection(c) => Source::Collection(c.clone()),
            Source::Query(q) => Source::Query(q.clone()),
            Source::Aggregation(a) => Source::Aggregation(a.clone()),
        }
    }
}

impl<D: Driver> From<Query<D>> for Source<D> {
    fn from(query: Query<D>) -> Self {
        Source::Query(Arc::new(query))
    }
}

impl<D: Driver> From<Aggregation<D>> for Source<D> {
    fn from(aggregation: Aggregation<D>) -> Self {
        Source::Aggregation(Arc::new(aggregation))
    }
}

/// A database server; its identifier is its name
pub struct Server<D: Driver> {
    ctx: Arc<Context<D>>,
    name: String,
    databases: Mutex<BoundedCache<String, Arc<Database<D>>>>,
}

impl<D: Driver> Server<D> {
    pub(crate) fn new(ctx: Arc<Context<D>>, name: &str) -> Self {
        let databases = Mutex::new(BoundedCache::new(ctx.config.node_capacity));
        Self {
            ctx,
            name: name.to_string(),
            databases,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Database node hosted on this server, created on first request
    pub fn database(&self, name: &str) -> Arc<Database<D>> {
        let mut databases = self.databases.lock();
        if let Some(database) = databases.get(name) {
            return database.clone();
        }

        let database = Arc::new(Database::new(self.ctx.clone(), self.node_ref(), name));
        if let Some((_, evicted)) = databases.insert(name.to_string(), database.clone()) {
            debug!("Evicted database node {}", evicted.identifier);
            self.ctx.connections.invalidate(&evicted.identifier);
        }
        database
    }

    /// Driver connection for this server, opened on first use
    ///
    /// Fails with `CredentialsNotFound` when the credential store has no
    /// entry for this server.
    pub async fn connect(&self) -> Result<D::Server> {
        self.ctx.server_handle(&self.name, &self.name).await
    }

    fn node_ref(&self) -> NodeRef {
        NodeRef {
            name: self.name.clone(),
            identifier: self.name.clone(),
        }
    }
}

impl<D: Driver> DataSource for Server<D> {
    fn identifier(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Server
    }

    fn backend(&self) -> &str {
        self.ctx.driver.backend()
    }
}

impl<D: Driver> fmt::Display for Server<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        describe(self, f)
    }
}

pub struct Database<D: Driver> {
    ctx: Arc<Context<D>>,
    server: NodeRef,
    name: String,
    identifier: String,
    collections: Mutex<BoundedCache<String, Arc<Collection<D>>>>,
}

impl<D: Driver> Database<D> {
    fn new(ctx: Arc<Context<D>>, server: NodeRef, name: &str) -> Self {
        let collections = Mutex::new(BoundedCache::new(ctx.config.node_capacity));
        Self {
            identifier: compose(&server.identifier, name),
            ctx,
            server,
            name: name.to_string(),
            collections,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_name(&self) -> &str {
        &self.server.name
    }

    /// Collection node in this database, created on first request
    pub fn collection(&self, name: &str) -> Arc<Collection<D>> {
        let mut collections = self.collections.lock();
        if let Some(collection) = collections.get(name) {
            return collection.clone();
        }

        let collection = Arc::new(Collection::new(
            self.ctx.clone(),
            self.server.clone(),
            self.node_ref(),
            name,
        ));
        if let Some((_, evicted)) = collections.insert(name.to_string(), collection.clone()) {
            debug!("Evicted collection node {}", evicted.identifier);
            self.ctx.connections.invalidate(&evicted.identifier);
        }
        collection
    }

    /// Database handle derived from the server connection
    pub async fn connect(&self) -> Result<D::Database> {
        self.ctx.database_handle(&self.server, &self.node_ref()).await
    }

    fn node_ref(&self) -> NodeRef {
        NodeRef {
            name: self.name.clone(),
            identifier: self.identifier.clone(),
        }
    }
}

impl<D: Driver> DataSource for Database<D> {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Database
    }

    fn backend(&self) -> &str {
        self.ctx.driver.backend()
    }
}

impl<D: Driver> fmt::Display for Database<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        describe(self, f)
    }
}

pub struct Collection<D: Driver> {
    pub(crate) ctx: Arc<Context<D>>,
    server: NodeRef,
    database: NodeRef,
    name: String,
    identifier: String,
}

impl<D: Driver> Collection<D> {
    fn new(ctx: Arc<Context<D>>, server: NodeRef, database: NodeRef, name: &str) -> Self {
        Self {
            identifier: compose(&database.identifier, name),
            ctx,
            server,
            database,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database_name(&self) -> &str {
        &self.database.name
    }

    pub fn server_name(&self) -> &str {
        &self.server.name
    }

    /// Collection handle derived from the database handle
    pub async fn connect(&self) -> Result<D::Collection> {
        self.ctx
            .collection_handle(&self.server, &self.database, &self.node_ref())
            .await
    }

    fn node_ref(&self) -> NodeRef {
        NodeRef {
            name: self.name.clone(),
            identifier: self.identifier.clone(),
        }
    }
}

impl<D: Driver> DataSource for Collection<D> {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Collection
    }

    fn backend(&self) -> &str {
        self.ctx.driver.backend()
    }
}

impl<D: Driver> fmt::Display for Collection<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        describe(self, f)
    }
}
