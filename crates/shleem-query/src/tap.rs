//! Tappable sources: queries and aggregations over a collection
//!
//! A tap is built once from a template and is immutable afterwards. Each
//! call to [`Tappable::tap`] resolves the template against fresh arguments
//! and streams records from the store as they are consumed.

use crate::driver::{Driver, FindSpec, RecordStream};
use crate::error::{Result, TapError};
use crate::hash::content_hash;
use crate::identifier::compose;
use crate::source::{describe, Collection, DataSource, SourceKind};
use crate::template::{resolve, TapArgs, Template};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Capability of producing a lazy record sequence from the store
#[async_trait]
pub trait Tappable: DataSource {
    /// Resolve the source's template with `args` and start fetching records
    ///
    /// The returned stream is single-pass and reflects the store at fetch
    /// time.
    async fn tap(&self, args: &TapArgs) -> Result<RecordStream>;
}

/// Fields returned by a query
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Field names to include
    Fields(Vec<String>),
    /// A driver projection document, e.g. `{"_id": 0, "name": 1}`
    Spec(Map<String, Value>),
}

impl Projection {
    pub fn fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Projection::Fields(fields.into_iter().map(Into::into).collect())
    }

    pub fn to_document(&self) -> Map<String, Value> {
        match self {
            Projection::Fields(fields) => fields
                .iter()
                .map(|f| (f.clone(), Value::from(1)))
                .collect(),
            Projection::Spec(spec) => spec.clone(),
        }
    }
}

/// Optional settings for [`Collection::query_with`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    /// Local identifier; defaults to the template's content hash
    pub identifier: Option<String>,
    pub projection: Option<Projection>,
    /// Matches to omit from the start of the result set
    pub skip: u64,
    /// Maximum records to return; `None` is unbounded, `Some(0)` returns nothing
    pub limit: Option<u64>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

fn tap_identifier(parent: &str, explicit: Option<String>, template: &Template) -> Result<String> {
    let local = match explicit {
        Some(id) => id,
        None => content_hash(template)?,
    };
    Ok(compose(parent, &local))
}

fn into_document(value: Value, what: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(TapError::invalid_template(format!(
            "{} must resolve to a mapping, got {}",
            what, other
        ))),
    }
}

impl<D: Driver> Collection<D> {
    /// Query against this collection with default options
    pub fn query(self: &Arc<Self>, template: impl Into<Template>) -> Result<Query<D>> {
        self.query_with(template, QueryOptions::default())
    }

    pub fn query_with(
        self: &Arc<Self>,
        template: impl Into<Template>,
        options: QueryOptions,
    ) -> Result<Query<D>> {
        let template = template.into();
        if !matches!(template, Template::Document(_) | Template::Param(_)) {
            return Err(TapError::invalid_template("query filter must be a mapping"));
        }

        let identifier = tap_identifier(self.identifier(), options.identifier, &template)?;
        debug!("Created query {}", identifier);

        Ok(Query {
            collection: self.clone(),
            identifier,
            template,
            projection: options.projection,
            skip: options.skip,
            limit: options.limit,
        })
    }

    /// Aggregation pipeline against this collection
    pub fn aggregation<I>(self: &Arc<Self>, stages: I) -> Result<Aggregation<D>>
    where
        I: IntoIterator<Item = Template>,
    {
        self.aggregation_with(stages, None)
    }

    pub fn aggregation_with<I>(
        self: &Arc<Self>,
        stages: I,
        identifier: Option<String>,
    ) -> Result<Aggregation<D>>
    where
        I: IntoIterator<Item = Template>,
    {
        let stages: Vec<Template> = stages.into_iter().collect();
        if let Some(pos) = stages
            .iter()
            .position(|s| !matches!(s, Template::Document(_) | Template::Param(_)))
        {
            return Err(TapError::invalid_template(format!(
                "aggregation stage {} must be a mapping",
                pos
            )));
        }

        let pipeline = Template::Array(stages.clone());
        let identifier = tap_identifier(self.identifier(), identifier, &pipeline)?;
        debug!("Created aggregation {}", identifier);

        Ok(Aggregation {
            collection: self.clone(),
            identifier,
            stages,
        })
    }
}

/// A filter query over a collection
pub struct Query<D: Driver> {
    collection: Arc<Collection<D>>,
    identifier: String,
    template: Template,
    projection: Option<Projection>,
    skip: u64,
    limit: Option<u64>,
}

impl<D: Driver> Query<D> {
    pub fn collection(&self) -> &Arc<Collection<D>> {
        &self.collection
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    pub fn projection(&self) -> Option<&Projection> {
        self.projection.as_ref()
    }

    pub fn skip(&self) -> u64 {
        self.skip
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }
}

#[async_trait]
impl<D: Driver> Tappable for Query<D> {
    async fn tap(&self, args: &TapArgs) -> Result<RecordStream> {
        let filter = into_document(resolve(&self.template, args)?, "query filter")?;

        if self.limit == Some(0) {
            debug!("Query {} has a zero limit, nothing to fetch", self.identifier);
            return Ok(stream::empty().boxed());
        }

        let handle = self.collection.connect().await?;
        debug!(
            "Tapping query {} (skip {}, limit {:?})",
            self.identifier, self.skip, self.limit
        );

        let spec = FindSpec {
            filter,
            projection: self.projection.as_ref().map(Projection::to_document),
            skip: self.skip,
            limit: self.limit,
        };
        self.collection.ctx.driver.find(&handle, spec).await
    }
}

impl<D: Driver> DataSource for Query<D> {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Query
    }

    fn backend(&self) -> &str {
        self.collection.backend()
    }
}

impl<D: Driver> fmt::Display for Query<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        describe(self, f)
    }
}

/// An ordered aggregation pipeline over a collection
pub struct Aggregation<D: Driver> {
    collection: Arc<Collection<D>>,
    identifier: String,
    stages: Vec<Template>,
}

impl<D: Driver> Aggregation<D> {
    pub fn collection(&self) -> &Arc<Collection<D>> {
        &self.collection
    }

    pub fn stages(&self) -> &[Template] {
        &self.stages
    }
}

#[async_trait]
impl<D: Driver> Tappable for Aggregation<D> {
    async fn tap(&self, args: &TapArgs) -> Result<RecordStream> {
        let pipeline = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, stage)| into_document(resolve(stage, args)?, &format!("stage {}", i)))
            .collect::<Result<Vec<_>>>()?;

        let handle = self.collection.connect().await?;
        debug!(
            "Tapping aggregation {} ({} stages)",
            self.identifier,
            pipeline.len()
        );
        self.collection.ctx.driver.aggregate(&handle, pipeline).await
    }
}

impl<D: Driver> DataSource for Aggregation<D> {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Aggregation
    }

    fn backend(&self) -> &str {
        self.collection.backend()
    }
}

impl<D: Driver> fmt::Display for Aggregation<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        describe(self, f)
    }
}
