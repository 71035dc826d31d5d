//! Stable content hashing of templates
//!
//! Used to derive an identifier for queries and aggregations created without
//! one. The digest depends only on template content: slots hash as their
//! names and mapping keys are canonicalized into sorted order.

use crate::error::{Result, TapError};
use crate::template::Template;
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

/// Replace every parameter slot with its name and sort mapping keys
pub fn sanitize(template: &Template) -> Result<Value> {
    match template {
        Template::Null => Ok(Value::Null),
        Template::Bool(b) => Ok(Value::Bool(*b)),
        Template::Int(i) => Ok(Value::from(*i)),
        Template::Float(f) => Number::from_f64(*f).map(Value::Number).ok_or_else(|| {
            TapError::UnhashableTemplate(format!("non-finite number {}", f))
        }),
        Template::String(s) => Ok(Value::String(s.clone())),
        Template::Array(items) => items
            .iter()
            .map(sanitize)
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Template::Document(fields) => {
            let mut sorted: Vec<&(String, Template)> = fields.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));

            let mut map = Map::with_capacity(sorted.len());
            for (key, value) in sorted {
                map.insert(key.clone(), sanitize(value)?);
            }
            Ok(Value::Object(map))
        }
        Template::Param(slot) => Ok(Value::String(slot.name().to_string())),
    }
}

/// Hex-encoded SHA-256 of the sanitized template's compact JSON form
pub fn content_hash(template: &Template) -> Result<String> {
    let sanitized = sanitize(template)?;
    let bytes = serde_json::to_vec(&sanitized)
        .map_err(|e| TapError::UnhashableTemplate(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_is_deterministic() {
        let a = Template::from(json!({"status": "open"}));
        let b = Template::from(json!({"status": "open"}));
        let digest = content_hash(&a).unwrap();
        assert_eq!(digest, content_hash(&b).unwrap());
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_matches_known_digest() {
        // sha256 of the compact JSON {"status":"open"}
        let template = Template::from(json!({"status": "open"}));
        let mut hasher = Sha256::new();
        hasher.update(br#"{"status":"open"}"#);
        assert_eq!(content_hash(&template).unwrap(), hex::encode(hasher.finalize()));
    }

    #[test]
    fn test_hash_ignores_key_insertion_order() {
        let a = Template::doc([("a", Template::Int(1)), ("b", Template::Int(2))]);
        let b = Template::doc([("b", Template::Int(2)), ("a", Template::Int(1))]);
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn test_hash_respects_sequence_order() {
        let a = Template::from(json!([{"$match": {}}, {"$limit": 5}]));
        let b = Template::from(json!([{"$limit": 5}, {"$match": {}}]));
        assert_ne!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn test_distinct_content_distinct_hash() {
        let corpus = vec![
            json!({"status": "open"}),
            json!({"status": "closed"}),
            json!({"state": "open"}),
            json!({"status": ["open"]}),
            json!({"status": {"$eq": "open"}}),
            json!({"n": 1}),
            json!({"n": 1.5}),
            json!({"n": "1"}),
            json!({"n": null}),
            json!({"n": true}),
            json!({}),
            json!([]),
        ];
        let mut digests: Vec<String> = corpus
            .into_iter()
            .map(|v| content_hash(&Template::from(v)).unwrap())
            .collect();
        let total = digests.len();
        digests.sort();
        digests.dedup();
        assert_eq!(digests.len(), total);
    }

    #[test]
    fn test_slots_hash_by_name() {
        let a = Template::doc([("x", Template::param("min"))]);
        let b = Template::doc([("x", Template::derived("min", |_| Ok(json!(42))))]);
        let c = Template::doc([("x", Template::param("max"))]);
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
        assert_ne!(content_hash(&a).unwrap(), content_hash(&c).unwrap());

        assert_eq!(sanitize(&a).unwrap(), json!({"x": "min"}));
    }

    #[test]
    fn test_non_finite_float_is_unhashable() {
        let template = Template::doc([("x", Template::Float(f64::INFINITY))]);
        assert!(matches!(
            content_hash(&template),
            Err(TapError::UnhashableTemplate(_))
        ));
    }
}
