//! Cache key derivation.

use crate::{Error, ErrorContext, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Default number of hex characters kept from the digest.
pub const DEFAULT_HASH_WIDTH: usize = 16;
const MIN_HASH_WIDTH: usize = 16;
const MAX_HASH_WIDTH: usize = 64;

/// Derives `{service}:{namespace}:{hash}` keys from ordered argument tuples.
///
/// Arguments are serialized to JSON with object keys sorted at every depth, so two
/// mappings with the same content hash identically no matter how they were built.
/// Sequence order is kept: `("en", "fr")` and `("fr", "en")` are different keys.
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    service_name: String,
    hash_width: usize,
}

impl KeyDeriver {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            hash_width: DEFAULT_HASH_WIDTH,
        }
    }

    /// Width is clamped to 16..=64 hex characters.
    pub fn with_hash_width(mut self, width: usize) -> Self {
        self.hash_width = width.clamp(MIN_HASH_WIDTH, MAX_HASH_WIDTH);
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Derive a key for `namespace` from `args`.
    ///
    /// `args` is normally a tuple or slice; a non-sequence value is treated as a
    /// one-element argument list. Fails with `InvalidArgument` when `args` cannot be
    /// represented as JSON (e.g. a map with non-string keys).
    pub fn derive<A: Serialize + ?Sized>(&self, namespace: &str, args: &A) -> Result<String> {
        let value = serde_json::to_value(args).map_err(|e| {
            Error::invalid_argument_with_context(
                format!("cache key arguments are not serializable: {}", e),
                ErrorContext::new()
                    .with_field_path(namespace)
                    .with_source("key_deriver"),
            )
        })?;
        let args = match value {
            Value::Array(items) => Value::Array(items),
            other => Value::Array(vec![other]),
        };

        let mut canonical = String::new();
        write_canonical(&args, &mut canonical);

        let digest = Sha256::digest(canonical.as_bytes());
        let mut hash = hex::encode(digest);
        hash.truncate(self.hash_width);

        Ok(format!("{}:{}:{}", self.service_name, namespace, hash))
    }

    /// Glob pattern matching every key of `namespace` (for invalidation).
    pub fn namespace_pattern(&self, namespace: &str) -> String {
        format!("{}:{}:*", self.service_name, namespace)
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap, HashSet};

    fn deriver() -> KeyDeriver {
        KeyDeriver::new("ai-ml-service")
    }

    #[test]
    fn test_key_format() {
        let key = deriver()
            .derive("translation", &("Hello", "en", "fr"))
            .unwrap();
        let parts: Vec<&str> = key.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "ai-ml-service");
        assert_eq!(parts[1], "translation");
        assert_eq!(parts[2].len(), DEFAULT_HASH_WIDTH);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
        assert!(key.len() >= 32);
    }

    #[test]
    fn test_deterministic() {
        let d = deriver();
        let a = d.derive("translation", &("Hello", "en", "fr")).unwrap();
        let b = d.derive("translation", &("Hello", "en", "fr")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sequence_order_matters() {
        let d = deriver();
        let a = d.derive("translation", &("Hello", "en", "fr")).unwrap();
        let b = d.derive("translation", &("Hello", "fr", "en")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_mapping_order_invariance() {
        let d = deriver();
        let ab = json!({"a": 1, "b": 2});
        let mut ba = serde_json::Map::new();
        ba.insert("b".into(), json!(2));
        ba.insert("a".into(), json!(1));
        let ka = d.derive("prediction", &("churn", &ab)).unwrap();
        let kb = d.derive("prediction", &("churn", &Value::Object(ba))).unwrap();
        assert_eq!(ka, kb);

        let mut hm = HashMap::new();
        hm.insert("b", 2);
        hm.insert("a", 1);
        let mut bm = BTreeMap::new();
        bm.insert("a", 1);
        bm.insert("b", 2);
        assert_eq!(
            d.derive("prediction", &("churn", &hm)).unwrap(),
            d.derive("prediction", &("churn", &bm)).unwrap()
        );
    }

    #[test]
    fn test_nested_mapping_order_invariance() {
        let d = deriver();
        let a = json!({"outer": {"x": [1, 2], "y": {"p": true, "q": null}}});
        let b = json!({"outer": {"y": {"q": null, "p": true}, "x": [1, 2]}});
        assert_eq!(
            d.derive("recommendation", &("u1", "home", &a)).unwrap(),
            d.derive("recommendation", &("u1", "home", &b)).unwrap()
        );
    }

    #[test]
    fn test_namespace_separates_keys() {
        let d = deriver();
        let a = d.derive("translation", &("x",)).unwrap();
        let b = d.derive("prediction", &("x",)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_no_collisions_on_near_duplicates() {
        let d = deriver();
        let mut seen = HashSet::new();
        for i in 0..2000 {
            let text = format!("Hello world {}", i);
            assert!(seen.insert(d.derive("translation", &(&text, "en", "fr")).unwrap()));
            assert!(seen.insert(d.derive("translation", &(&text, "en", "de")).unwrap()));
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn test_none_and_missing_argument_differ() {
        let d = deriver();
        let with_none = d
            .derive("recommendation", &("u1", "home", Option::<Value>::None))
            .unwrap();
        let without = d.derive("recommendation", &("u1", "home")).unwrap();
        assert_ne!(with_none, without);
    }

    #[test]
    fn test_scalar_argument_wrapped() {
        let d = deriver();
        assert_eq!(
            d.derive("prediction", "only").unwrap(),
            d.derive("prediction", &["only"]).unwrap()
        );
    }

    #[test]
    fn test_unserializable_argument_is_invalid() {
        let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
        bad.insert((1, 2), 3);
        let err = deriver().derive("prediction", &("m", &bad)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_hash_width_clamped() {
        let short = KeyDeriver::new("svc").with_hash_width(4);
        let key = short.derive("translation", &("a",)).unwrap();
        assert_eq!(key.rsplit(':').next().map(str::len), Some(16));

        let full = KeyDeriver::new("svc").with_hash_width(500);
        let key = full.derive("translation", &("a",)).unwrap();
        assert_eq!(key.rsplit(':').next().map(str::len), Some(64));
    }

    #[test]
    fn test_namespace_pattern() {
        assert_eq!(
            deriver().namespace_pattern("translation"),
            "ai-ml-service:translation:*"
        );
    }
}
