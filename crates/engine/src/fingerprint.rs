//! Deterministic configuration fingerprints used as dedup keys

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// SHA-256 (lowercase hex) of the canonical JSON form of `config`
pub fn fingerprint<T: Serialize>(config: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(config)?;
    Ok(fingerprint_value(&value))
}

/// Object keys are sorted at every depth, so field order never matters
pub fn fingerprint_value(value: &Value) -> String {
    let canonical = canonicalize(value).to_string();
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key.clone(), canonicalize(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BotConfiguration;

    #[test]
    fn test_field_order_is_ignored() {
        let a: Value =
            serde_json::from_str(r#"{"rsi": {"period": 14, "low": 30}, "size": 25}"#).unwrap();
        let b: Value =
            serde_json::from_str(r#"{"size": 25, "rsi": {"low": 30, "period": 14}}"#).unwrap();
        assert_eq!(fingerprint_value(&a), fingerprint_value(&b));
    }

    #[test]
    fn test_different_values_differ() {
        let base = BotConfiguration::default();
        let other = BotConfiguration {
            rsi_period: 21,
            ..BotConfiguration::default()
        };
        assert_ne!(fingerprint(&base).unwrap(), fingerprint(&other).unwrap());
    }

    #[test]
    fn test_deterministic_hex_digest() {
        let config = BotConfiguration::default();
        let first = fingerprint(&config).unwrap();
        assert_eq!(first, fingerprint(&config.clone()).unwrap());
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_struct_and_value_agree() {
        let config = BotConfiguration::default();
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(fingerprint(&config).unwrap(), fingerprint_value(&value));
    }
}
