use crate::credentials::ServerCredentials;
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{Map, Value};

/// A single document returned by a tap
pub type Record = Map<String, Value>;

/// Lazily realized, single-pass sequence of records
pub type RecordStream = BoxStream<'static, Result<Record>>;

/// Execution options handed to [`Driver::find`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindSpec {
    pub filter: Map<String, Value>,
    pub projection: Option<Map<String, Value>>,
    pub skip: u64,
    /// `None` means no limit
    pub limit: Option<u64>,
}

/// The database driver the source tree delegates to
///
/// Handles are cheap to clone and shared by every tap on the same node.
/// Errors returned by a driver reach the caller unchanged.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    type Server: Clone + Send + Sync + 'static;
    type Database: Clone + Send + Sync + 'static;
    type Collection: Clone + Send + Sync + 'static;

    /// Name of the backend, e.g. "MongoDB"
    fn backend(&self) -> &'static str;

    /// Open a connection to a server
    async fn connect(
        &self,
        server_name: &str,
        credentials: &ServerCredentials,
    ) -> Result<Self::Server>;

    /// Derive a database handle from a server handle
    fn database(&self, server: &Self::Server, name: &str) -> Self::Database;

    /// Derive a collection handle from a database handle
    fn collection(&self, database: &Self::Database, name: &str) -> Self::Collection;

    /// Run a filter query
    async fn find(&self, collection: &Self::Collection, spec: FindSpec) -> Result<RecordStream>;

    /// Run an aggregation pipeline, stages in order
    async fn aggregate(
        &self,
        collection: &Self::Collection,
        pipeline: Vec<Map<String, Value>>,
    ) -> Result<RecordStream>;
}
