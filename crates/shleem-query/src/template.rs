//! Parameterized query templates
//!
//! A [`Template`] is a nested structure of mappings, sequences and scalars in
//! which any leaf may be a [`ParameterSlot`]. Slots are filled from a
//! [`TapArgs`] set each time the template is resolved, so one definition can
//! be executed repeatedly with different runtime arguments.

use crate::error::{Result, TapError};
use serde_json::{Map, Number, Value};
use std::fmt;
use std::sync::Arc;

/// Function computing a slot's value from the full argument set
pub type SlotResolver = dyn Fn(&TapArgs) -> Result<Value> + Send + Sync;

/// Named runtime arguments supplied when tapping a source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TapArgs {
    values: Map<String, Value>,
}

impl TapArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Look up an argument, failing with `MissingParameter` when absent
    pub fn require(&self, name: &str) -> Result<&Value> {
        self.values
            .get(name)
            .ok_or_else(|| TapError::missing_parameter(name))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

impl From<Map<String, Value>> for TapArgs {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for TapArgs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// A placeholder resolved at tap time
///
/// Slots compare equal when their names are equal; the resolver is not part
/// of a template's content.
#[derive(Clone)]
pub struct ParameterSlot {
    name: String,
    resolver: Option<Arc<SlotResolver>>,
}

impl ParameterSlot {
    /// Slot that takes the argument of the same name verbatim
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resolver: None,
        }
    }

    /// Slot computed from the whole argument set
    pub fn derived<F>(name: impl Into<String>, resolver: F) -> Self
    where
        F: Fn(&TapArgs) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            resolver: Some(Arc::new(resolver)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resolve(&self, args: &TapArgs) -> Result<Value> {
        match &self.resolver {
            Some(resolver) => resolver(args),
            None => args.require(&self.name).cloned(),
        }
    }
}

impl fmt::Debug for ParameterSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterSlot")
            .field("name", &self.name)
            .field("derived", &self.resolver.is_some())
            .finish()
    }
}

impl PartialEq for ParameterSlot {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

/// Query or pipeline template
#[derive(Debug, Clone, PartialEq)]
pub enum Template {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Template>),
    /// Mapping with insertion-ordered keys
    Document(Vec<(String, Template)>),
    Param(ParameterSlot),
}

impl Template {
    /// Build a mapping; a repeated key replaces the earlier value in place
    pub fn doc<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Template)>,
        K: Into<String>,
    {
        let mut fields: Vec<(String, Template)> = Vec::new();
        for (key, value) in entries {
            let key = key.into();
            match fields.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = value,
                None => fields.push((key, value)),
            }
        }
        Template::Document(fields)
    }

    pub fn param(name: impl Into<String>) -> Self {
        Template::Param(ParameterSlot::named(name))
    }

    pub fn derived<F>(name: impl Into<String>, resolver: F) -> Self
    where
        F: Fn(&TapArgs) -> Result<Value> + Send + Sync + 'static,
    {
        Template::Param(ParameterSlot::derived(name, resolver))
    }

    pub fn is_document(&self) -> bool {
        matches!(self, Template::Document(_))
    }

    /// Whether any parameter slot appears anywhere in the template
    pub fn has_params(&self) -> bool {
        match self {
            Template::Param(_) => true,
            Template::Array(items) => items.iter().any(Template::has_params),
            Template::Document(fields) => fields.iter().any(|(_, v)| v.has_params()),
            _ => false,
        }
    }

    /// Names of all parameter slots, sorted and deduplicated
    pub fn param_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_param_names(&mut names);
        names.sort();
        names.dedup();
        names
    }

    fn collect_param_names(&self, names: &mut Vec<String>) {
        match self {
            Template::Param(slot) => names.push(slot.name().to_string()),
            Template::Array(items) => items.iter().for_each(|i| i.collect_param_names(names)),
            Template::Document(fields) => fields
                .iter()
                .for_each(|(_, v)| v.collect_param_names(names)),
            _ => {}
        }
    }
}

/// Materialize a template against runtime arguments
///
/// Works on a fresh copy: the template is never modified. Every slot is
/// invoked with the whole argument set; key order of mappings is kept.
pub fn resolve(template: &Template, args: &TapArgs) -> Result<Value> {
    match template {
        Template::Null => Ok(Value::Null),
        Template::Bool(b) => Ok(Value::Bool(*b)),
        Template::Int(i) => Ok(Value::from(*i)),
        Template::Float(f) => Number::from_f64(*f).map(Value::Number).ok_or_else(|| {
            TapError::invalid_template(format!("number {} has no JSON representation", f))
        }),
        Template::String(s) => Ok(Value::String(s.clone())),
        Template::Array(items) => items
            .iter()
            .map(|item| resolve(item, args))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Template::Document(fields) => {
            let mut map = Map::with_capacity(fields.len());
            for (key, value) in fields {
                map.insert(key.clone(), resolve(value, args)?);
            }
            Ok(Value::Object(map))
        }
        Template::Param(slot) => slot.resolve(args),
    }
}

impl From<Value> for Template {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Template::Null,
            Value::Bool(b) => Template::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Template::Int(i),
                None => Template::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Template::String(s),
            Value::Array(items) => Template::Array(items.into_iter().map(Template::from).collect()),
            Value::Object(map) => Template::Document(
                map.into_iter()
                    .map(|(k, v)| (k, Template::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Template {
    fn from(s: &str) -> Self {
        Template::String(s.to_string())
    }
}

impl From<String> for Template {
    fn from(s: String) -> Self {
        Template::String(s)
    }
}

impl From<i64> for Template {
    fn from(i: i64) -> Self {
        Template::Int(i)
    }
}

impl From<i32> for Template {
    fn from(i: i32) -> Self {
        Template::Int(i as i64)
    }
}

impl From<f64> for Template {
    fn from(f: f64) -> Self {
        Template::Float(f)
    }
}

impl From<bool> for Template {
    fn from(b: bool) -> Self {
        Template::Bool(b)
    }
}

impl From<Vec<Template>> for Template {
    fn from(items: Vec<Template>) -> Self {
        Template::Array(items)
    }
}

impl From<ParameterSlot> for Template {
    fn from(slot: ParameterSlot) -> Self {
        Template::Param(slot)
    }
}
