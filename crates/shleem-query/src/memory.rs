//! In-process driver holding documents in memory
//!
//! Useful for tests and for working with taps offline. Supports equality and
//! comparison filters, inclusion/exclusion projections, skip and limit, and a
//! small set of pipeline stages (`$match`, `$skip`, `$limit`, `$project`,
//! `$sort`, `$count`, `$group` with `$sum`).

use crate::credentials::ServerCredentials;
use crate::driver::{Driver, FindSpec, Record, RecordStream};
use crate::error::{Result, TapError};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub const MEMORY_BACKEND: &str = "Memory";

#[derive(Error, Debug)]
pub enum MemoryDriverError {
    #[error("Server unreachable: {0}")]
    Unreachable(String),

    #[error("Unsupported pipeline stage: {0}")]
    UnsupportedStage(String),

    #[error("Invalid {stage} stage: {message}")]
    InvalidStage { stage: String, message: String },
}

fn invalid_stage(stage: &str, message: impl Into<String>) -> TapError {
    TapError::driver(MemoryDriverError::InvalidStage {
        stage: stage.to_string(),
        message: message.into(),
    })
}

type CollectionKey = (String, String, String);

#[derive(Debug, Clone)]
pub struct MemoryServer {
    name: String,
}

#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    server: String,
    name: String,
}

#[derive(Debug, Clone)]
pub struct MemoryCollection {
    key: CollectionKey,
}

/// Driver over an in-memory document store
///
/// Clones share the same store, so a test can keep one clone to seed data
/// while the catalog owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    store: Arc<RwLock<BTreeMap<CollectionKey, Vec<Record>>>>,
    unreachable: Arc<RwLock<HashSet<String>>>,
    connects: Arc<AtomicUsize>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append documents to a collection; non-object values are skipped
    pub fn insert_many<I>(&self, server: &str, database: &str, collection: &str, docs: I)
    where
        I: IntoIterator<Item = Value>,
    {
        let key = (
            server.to_string(),
            database.to_string(),
            collection.to_string(),
        );
        let mut store = self.store.write();
        let records = store.entry(key).or_default();
        records.extend(docs.into_iter().filter_map(|doc| match doc {
            Value::Object(map) => Some(map),
            _ => None,
        }));
    }

    /// Make every later `connect` to this server fail
    pub fn set_unreachable(&self, server: &str) {
        self.unreachable.write().insert(server.to_string());
    }

    /// Number of successful `connect` calls so far
    pub fn connect_count(&self) -> usize {
        self.connects.load(AtomicOrdering::SeqCst)
    }

    fn snapshot(&self, collection: &MemoryCollection) -> Vec<Record> {
        self.store
            .read()
            .get(&collection.key)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    type Server = MemoryServer;
    type Database = MemoryDatabase;
    type Collection = MemoryCollection;

    fn backend(&self) -> &'static str {
        MEMORY_BACKEND
    }

    async fn connect(
        &self,
        server_name: &str,
        credentials: &ServerCredentials,
    ) -> Result<Self::Server> {
        if self.unreachable.read().contains(server_name) {
            return Err(TapError::driver(MemoryDriverError::Unreachable(
                server_name.to_string(),
            )));
        }
        self.connects.fetch_add(1, AtomicOrdering::SeqCst);
        debug!(
            "Memory driver connected to {} ({} hosts)",
            server_name,
            credentials.hosts.len()
        );
        Ok(MemoryServer {
            name: server_name.to_string(),
        })
    }

    fn database(&self, server: &Self::Server, name: &str) -> Self::Database {
        MemoryDatabase {
            server: server.name.clone(),
            name: name.to_string(),
        }
    }

    fn collection(&self, database: &Self::Database, name: &str) -> Self::Collection {
        MemoryCollection {
            key: (
                database.server.clone(),
                database.name.clone(),
                name.to_string(),
            ),
        }
    }

    async fn find(&self, collection: &Self::Collection, spec: FindSpec) -> Result<RecordStream> {
        let FindSpec {
            filter,
            projection,
            skip,
            limit,
        } = spec;
        let limit = limit.map(|l| l as usize).unwrap_or(usize::MAX);

        // Filtering and projection run as the stream is polled
        let records = self
            .snapshot(collection)
            .into_iter()
            .filter(move |doc| matches_filter(doc, &filter))
            .skip(skip as usize)
            .take(limit)
            .map(move |doc| match &projection {
                Some(projection) => Ok(project(doc, projection)),
                None => Ok(doc),
            });

        Ok(stream::iter(records).boxed())
    }

    async fn aggregate(
        &self,
        collection: &Self::Collection,
        pipeline: Vec<Map<String, Value>>,
    ) -> Result<RecordStream> {
        let mut docs = self.snapshot(collection);
        for stage in &pipeline {
            docs = apply_stage(docs, stage)?;
        }
        Ok(stream::iter(docs.into_iter().map(Ok)).boxed())
    }
}

fn lookup<'a>(doc: &'a Record, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn matches_filter(doc: &Record, filter: &Map<String, Value>) -> bool {
    filter.iter().all(|(key, cond)| match key.as_str() {
        "$and" => sub_filters(cond).map_or(false, |fs| fs.iter().all(|f| matches_filter(doc, f))),
        "$or" => sub_filters(cond).map_or(false, |fs| fs.iter().any(|f| matches_filter(doc, f))),
        field => matches_condition(lookup(doc, field), cond),
    })
}

fn sub_filters(cond: &Value) -> Option<Vec<&Map<String, Value>>> {
    cond.as_array()?.iter().map(Value::as_object).collect()
}

fn is_operator_doc(cond: &Value) -> bool {
    cond.as_object()
        .map_or(false, |m| !m.is_empty() && m.keys().all(|k| k.starts_with('$')))
}

/// Value equality with numbers compared by magnitude, so `10` matches `10.0`
fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| same_value(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| same_value(x, y)))
        }
        _ => a == b,
    }
}

fn equals(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| same_value(item, expected))
        }
        Some(v) => same_value(v, expected),
        None => expected.is_null(),
    }
}

fn matches_condition(value: Option<&Value>, cond: &Value) -> bool {
    if !is_operator_doc(cond) {
        return equals(value, cond);
    }
    let Some(ops) = cond.as_object() else {
        return false;
    };
    ops.iter().all(|(op, arg)| match op.as_str() {
        "$eq" => equals(value, arg),
        "$ne" => !equals(value, arg),
        "$gt" => compare(value, arg) == Some(Ordering::Greater),
        "$gte" => matches!(compare(value, arg), Some(Ordering::Greater | Ordering::Equal)),
        "$lt" => compare(value, arg) == Some(Ordering::Less),
        "$lte" => matches!(compare(value, arg), Some(Ordering::Less | Ordering::Equal)),
        "$in" => arg
            .as_array()
            .map_or(false, |xs| xs.iter().any(|x| equals(value, x))),
        "$nin" => arg
            .as_array()
            .map_or(true, |xs| !xs.iter().any(|x| equals(value, x))),
        "$exists" => arg.as_bool().unwrap_or(true) == value.is_some(),
        _ => false,
    })
}

fn compare(value: Option<&Value>, arg: &Value) -> Option<Ordering> {
    match (value?, arg) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::Null => false,
        _ => true,
    }
}

fn project(doc: Record, projection: &Map<String, Value>) -> Record {
    let inclusive = projection.values().any(is_truthy);
    let keep_id = projection.get("_id").map_or(true, is_truthy);

    if inclusive {
        doc.into_iter()
            .filter(|(k, _)| {
                if k == "_id" {
                    keep_id
                } else {
                    projection.get(k).map_or(false, is_truthy)
                }
            })
            .collect()
    } else {
        doc.into_iter()
            .filter(|(k, _)| projection.get(k).map_or(true, is_truthy))
            .collect()
    }
}

fn apply_stage(docs: Vec<Record>, stage: &Map<String, Value>) -> Result<Vec<Record>> {
    let mut entries = stage.iter();
    let (name, arg) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        _ => {
            return Err(invalid_stage(
                "pipeline",
                "each stage must have exactly one operator",
            ))
        }
    };

    match name.as_str() {
        "$match" => {
            let filter = arg
                .as_object()
                .ok_or_else(|| invalid_stage(name, "expected a document"))?;
            Ok(docs.into_iter().filter(|d| matches_filter(d, filter)).collect())
        }
        "$skip" => {
            let n = arg
                .as_u64()
                .ok_or_else(|| invalid_stage(name, "expected a non-negative integer"))?;
            Ok(docs.into_iter().skip(n as usize).collect())
        }
        "$limit" => {
            let n = arg
                .as_u64()
                .ok_or_else(|| invalid_stage(name, "expected a non-negative integer"))?;
            Ok(docs.into_iter().take(n as usize).collect())
        }
        "$project" => {
            let projection = arg
                .as_object()
                .ok_or_else(|| invalid_stage(name, "expected a document"))?;
            Ok(docs.into_iter().map(|d| project(d, projection)).collect())
        }
        "$sort" => {
            let keys = arg
                .as_object()
                .ok_or_else(|| invalid_stage(name, "expected a document"))?;
            let mut docs = docs;
            docs.sort_by(|a, b| {
                for (field, direction) in keys {
                    let ord = sort_order(lookup(a, field), lookup(b, field));
                    let ord = if direction.as_i64() == Some(-1) {
                        ord.reverse()
                    } else {
                        ord
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
            Ok(docs)
        }
        "$count" => {
            let field = arg
                .as_str()
                .ok_or_else(|| invalid_stage(name, "expected a field name"))?;
            if docs.is_empty() {
                return Ok(Vec::new());
            }
            let mut record = Map::new();
            record.insert(field.to_string(), Value::from(docs.len() as u64));
            Ok(vec![record])
        }
        "$group" => {
            let spec = arg
                .as_object()
                .ok_or_else(|| invalid_stage(name, "expected a document"))?;
            group(docs, spec)
        }
        other => Err(TapError::driver(MemoryDriverError::UnsupportedStage(
            other.to_string(),
        ))),
    }
}

fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare(Some(a), b).unwrap_or(Ordering::Equal),
    }
}

fn eval_expression(doc: &Record, expr: &Value) -> Value {
    match expr {
        Value::String(s) if s.starts_with('$') => {
            lookup(doc, &s[1..]).cloned().unwrap_or(Value::Null)
        }
        other => other.clone(),
    }
}

#[derive(Default)]
struct Sum {
    int: i64,
    float: f64,
    is_float: bool,
}

impl Sum {
    fn add(&mut self, value: &Value) {
        if let Some(i) = value.as_i64() {
            match self.int.checked_add(i) {
                Some(sum) => self.int = sum,
                // Overflowing integer sums continue as doubles
                None => {
                    self.float += self.int as f64 + i as f64;
                    self.int = 0;
                    self.is_float = true;
                }
            }
        } else if let Some(f) = value.as_f64() {
            self.float += f;
            self.is_float = true;
        }
    }

    fn finish(&self) -> Value {
        if self.is_float {
            Number::from_f64(self.int as f64 + self.float)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        } else {
            Value::from(self.int)
        }
    }
}

fn group(docs: Vec<Record>, spec: &Map<String, Value>) -> Result<Vec<Record>> {
    let id_expr = spec
        .get("_id")
        .ok_or_else(|| invalid_stage("$group", "missing _id"))?;

    let mut accumulators: Vec<(&String, &Value)> = Vec::new();
    for (field, acc) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
        let expr = acc
            .as_object()
            .filter(|m| m.len() == 1)
            .and_then(|m| m.get("$sum"))
            .ok_or_else(|| {
                invalid_stage("$group", format!("field {} must use a single $sum", field))
            })?;
        accumulators.push((field, expr));
    }

    // Groups keep first-seen order
    let mut groups: Vec<(Value, Vec<Sum>)> = Vec::new();
    for doc in &docs {
        let key = eval_expression(doc, id_expr);
        let idx = match groups.iter().position(|(k, _)| *k == key) {
            Some(idx) => idx,
            None => {
                groups.push((key, accumulators.iter().map(|_| Sum::default()).collect()));
                groups.len() - 1
            }
        };
        for (sum, (_, expr)) in groups[idx].1.iter_mut().zip(&accumulators) {
            sum.add(&eval_expression(doc, expr));
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, sums)| {
            let mut record = Map::new();
            record.insert("_id".to_string(), key);
            for ((field, _), sum) in accumulators.iter().zip(&sums) {
                record.insert((*field).clone(), sum.finish());
            }
            record
        })
        .collect())
}
