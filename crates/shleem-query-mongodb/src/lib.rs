//! MongoDB implementation of the shleem-query `Driver` trait
//!
//! Servers map to `mongodb::Client`, databases to `mongodb::Database` and
//! collections to `mongodb::Collection<Document>`. Templates resolve to JSON
//! and are converted to BSON as extended JSON, so `{"$oid": ..}` and
//! `{"$date": ..}` values work in filters. Records come back as relaxed
//! extended JSON.
//!
//! ## Example
//!
//! ```rust,no_run
//! use futures::TryStreamExt;
//! use serde_json::json;
//! use shleem_query::{Catalog, CatalogConfig, TapArgs, Tappable, Template};
//! use shleem_query_mongodb::MongoDriver;
//!
//! # async fn example() -> shleem_query::Result<()> {
//! // Reads ~/.shleem/mongodb_credentials.json
//! let catalog = Catalog::from_config(MongoDriver::new(), CatalogConfig::new())?;
//!
//! let orders = catalog.server("primary").database("shop").collection("orders");
//! let open = orders.query(Template::from(json!({"status": "open"})))?;
//!
//! let mut records = open.tap(&TapArgs::new()).await?;
//! while let Some(record) = records.try_next().await? {
//!     println!("{:?}", record);
//! }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::StreamExt;
use mongodb::{options::ClientOptions, Client, Collection, Database};
use serde_json::{Map, Value};
use shleem_query::{Driver, FindSpec, Record, RecordStream, Result, ServerCredentials, TapError};
use tracing::{debug, error};

pub const MONGODB_BACKEND: &str = "MongoDB";

/// MongoDB driver binding
#[derive(Debug, Clone)]
pub struct MongoDriver {
    app_name: Option<String>,
    verify_connection: bool,
}

impl MongoDriver {
    pub fn new() -> Self {
        Self {
            app_name: Some("shleem".to_string()),
            verify_connection: true,
        }
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    /// Skip the ping issued after connecting; errors then surface on first use
    pub fn without_verification(mut self) -> Self {
        self.verify_connection = false;
        self
    }
}

impl Default for MongoDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a resolved JSON mapping into a BSON document
pub fn to_bson_document(map: Map<String, Value>) -> Result<Document> {
    Document::try_from(map)
        .map_err(|e| TapError::invalid_template(format!("cannot convert to BSON: {}", e)))
}

/// Convert a BSON document into a record
pub fn to_record(doc: Document) -> Record {
    match Bson::Document(doc).into_relaxed_extjson() {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn record_stream(cursor: mongodb::Cursor<Document>) -> RecordStream {
    cursor
        .map(|item| item.map(to_record).map_err(TapError::driver))
        .boxed()
}

#[async_trait]
impl Driver for MongoDriver {
    type Server = Client;
    type Database = Database;
    type Collection = Collection<Document>;

    fn backend(&self) -> &'static str {
        MONGODB_BACKEND
    }

    async fn connect(
        &self,
        server_name: &str,
        credentials: &ServerCredentials,
    ) -> Result<Self::Server> {
        debug!(
            "Creating MongoDB client for {} at {}",
            server_name,
            credentials.redacted()
        );

        let mut client_options = ClientOptions::parse(credentials.seed_list_uri())
            .await
            .map_err(|e| {
                error!("Failed to parse MongoDB URI for {}: {}", server_name, e);
                TapError::driver(e)
            })?;
        if client_options.app_name.is_none() {
            client_options.app_name = self.app_name.clone();
        }

        let client = Client::with_options(client_options).map_err(|e| {
            error!("Failed to create MongoDB client for {}: {}", server_name, e);
            TapError::driver(e)
        })?;

        if self.verify_connection {
            client
                .database("admin")
                .run_command(doc! { "ping": 1 })
                .await
                .map_err(|e| {
                    error!("Failed to connect to MongoDB server {}: {}", server_name, e);
                    TapError::driver(e)
                })?;
        }

        debug!("MongoDB client for {} created successfully", server_name);
        Ok(client)
    }

    fn database(&self, server: &Self::Server, name: &str) -> Self::Database {
        server.database(name)
    }

    fn collection(&self, database: &Self::Database, name: &str) -> Self::Collection {
        database.collection::<Document>(name)
    }

    async fn find(&self, collection: &Self::Collection, spec: FindSpec) -> Result<RecordStream> {
        let filter = to_bson_document(spec.filter)?;
        debug!(
            "Running find on {}.{}: {}",
            collection.namespace().db,
            collection.name(),
            filter
        );

        let mut find = collection.find(filter);
        if let Some(projection) = spec.projection {
            find = find.projection(to_bson_document(projection)?);
        }
        if spec.skip > 0 {
            find = find.skip(spec.skip);
        }
        if let Some(limit) = spec.limit {
            find = find.limit(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let cursor = find.await.map_err(|e| {
            error!("Find on {} failed: {}", collection.name(), e);
            TapError::driver(e)
        })?;
        Ok(record_stream(cursor))
    }

    async fn aggregate(
        &self,
        collection: &Self::Collection,
        pipeline: Vec<Map<String, Value>>,
    ) -> Result<RecordStream> {
        let stages = pipeline
            .into_iter()
            .map(to_bson_document)
            .collect::<Result<Vec<_>>>()?;
        debug!(
            "Running {}-stage aggregation on {}.{}",
            stages.len(),
            collection.namespace().db,
            collection.name()
        );

        let cursor = collection.aggregate(stages).await.map_err(|e| {
            error!("Aggregation on {} failed: {}", collection.name(), e);
            TapError::driver(e)
        })?;
        Ok(record_stream(cursor))
    }
}
