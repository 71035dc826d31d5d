//! # shleem-query
//!
//! Parameterized, reusable query definitions ("taps") over a hierarchy of
//! named data sources.
//!
//! A caller builds a source tree top-down (server, database, collection),
//! then derives taps from a collection by supplying a query or aggregation
//! template. Taps get a stable identifier at construction time and can be
//! executed repeatedly with different runtime arguments.
//!
//! ## Architecture
//!
//! - **identifier**: dotted hierarchical identifiers
//! - **hash**: stable content hashing of templates (fallback identifiers)
//! - **template**: templates with parameter slots and their resolution
//! - **source**: server, database and collection nodes with memoized child factories
//! - **tap**: the `Tappable` capability of queries and aggregations
//! - **cache**: bounded LRU caches and the per-node connection cache
//! - **driver**: the seam to the database driver (`Driver` trait)
//! - **memory**: an in-process `Driver` for tests and offline work
//!
//! ## Example
//!
//! ```rust
//! use futures::TryStreamExt;
//! use serde_json::json;
//! use shleem_query::{
//!     Catalog, CatalogConfig, CredentialStore, DataSource, MemoryDriver, ServerCredentials,
//!     TapArgs, Tappable, Template,
//! };
//!
//! # async fn example() -> shleem_query::Result<()> {
//! let driver = MemoryDriver::new();
//! driver.insert_many("primary", "shop", "orders", vec![json!({"status": "open", "total": 12})]);
//!
//! let credentials = CredentialStore::new().with_server(
//!     "primary",
//!     ServerCredentials::new(vec!["localhost:27017".to_string()], "reader", "secret"),
//! );
//! let catalog = Catalog::new(driver, credentials, CatalogConfig::new());
//!
//! let orders = catalog.server("primary").database("shop").collection("orders");
//! let big_orders = orders.query(Template::doc([(
//!     "total",
//!     Template::doc([("$gte", Template::param("min"))]),
//! )]))?;
//! assert!(big_orders.identifier().starts_with("primary.shop.orders."));
//!
//! let records: Vec<_> = big_orders
//!     .tap(&TapArgs::new().with("min", 10))
//!     .await?
//!     .try_collect()
//!     .await?;
//! assert_eq!(records.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Backend Implementation
//!
//! To bind a new database driver, implement [`Driver`] with the driver's
//! server, database and collection handle types. See `shleem-query-mongodb`.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod credentials;
pub mod driver;
pub mod error;
pub mod hash;
pub mod identifier;
pub mod memory;
pub mod source;
pub mod tap;
pub mod template;

// Re-export commonly used items
pub use cache::{BoundedCache, ConnectionCache};
pub use catalog::Catalog;
pub use config::CatalogConfig;
pub use credentials::{CredentialStore, ServerCredentials};
pub use driver::{Driver, FindSpec, Record, RecordStream};
pub use error::{Result, TapError};
pub use hash::{content_hash, sanitize};
pub use identifier::compose;
pub use memory::{MemoryDriver, MemoryDriverError};
pub use source::{Collection, DataSource, Database, GenericSource, Server, Source, SourceKind};
pub use tap::{Aggregation, Projection, Query, QueryOptions, Tappable};
pub use template::{resolve, ParameterSlot, TapArgs, Template};
