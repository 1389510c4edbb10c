//! Canonical JSON — the single encoding used for integrity hashing.
//!
//! Object keys are sorted lexicographically at every depth, arrays keep
//! their order, and no insignificant whitespace is emitted. Two documents
//! that differ only in key order or formatting canonicalize to identical
//! bytes, which is what makes the checkpoint HMAC non-forgeable by
//! re-serialization.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Serialize a JSON value into its canonical byte form.
pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        // serde_json's number formatting is already deterministic.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push_str(&serde_json::to_string(s).expect("string serialization is infallible"))
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(
                    &serde_json::to_string(key).expect("string serialization is infallible"),
                );
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

/// SHA-256 of the canonical form, as lowercase hex.
pub fn canonical_sha256(value: &Value) -> String {
    hex_digest(to_canonical_string(value).as_bytes())
}

/// Lowercase hex SHA-256 of arbitrary bytes.
pub fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// HMAC-SHA-256 of a message under a secret, as lowercase hex.
pub fn hmac_sha256_hex(secret: &[u8], message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(message);
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_at_every_depth() {
        let value = json!({"b": {"z": 1, "a": 2}, "a": [{"y": 1, "x": 2}]});
        assert_eq!(
            to_canonical_string(&value),
            r#"{"a":[{"x":2,"y":1}],"b":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn test_arrays_preserve_order() {
        let value = json!({"list": [3, 1, 2]});
        assert_eq!(to_canonical_string(&value), r#"{"list":[3,1,2]}"#);
    }

    #[test]
    fn test_hash_stable_under_key_permutation() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": {"p": true, "q": null}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y": {"q": null, "p": true}, "x": 1}"#).unwrap();
        assert_eq!(canonical_sha256(&a), canonical_sha256(&b));
    }

    #[test]
    fn test_hash_differs_on_value_change() {
        let a = json!({"x": 1});
        let b = json!({"x": 2});
        assert_ne!(canonical_sha256(&a), canonical_sha256(&b));
    }

    #[test]
    fn test_canonicalize_twice_is_identical() {
        let value = json!({
            "topic": "tabs vs spaces",
            "rounds": [{"n": 1, "ok": true}, {"n": 2, "ok": false}],
            "nested": {"b": [1.5, -2], "a": "s\"tr"}
        });
        let once = to_canonical_string(&value);
        let reparsed: Value = serde_json::from_str(&once).unwrap();
        assert_eq!(once, to_canonical_string(&reparsed));
    }

    #[test]
    fn test_string_escaping_preserved() {
        let value = json!({"s": "line\nbreak \"quoted\""});
        let canonical = to_canonical_string(&value);
        let reparsed: Value = serde_json::from_str(&canonical).unwrap();
        assert_eq!(value, reparsed);
    }

    #[test]
    fn test_hmac_known_shape() {
        let tag = hmac_sha256_hex(b"secret", b"message");
        assert_eq!(tag.len(), 64);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
        // Same inputs, same tag; different key, different tag.
        assert_eq!(tag, hmac_sha256_hex(b"secret", b"message"));
        assert_ne!(tag, hmac_sha256_hex(b"other", b"message"));
    }

    #[test]
    fn test_hex_digest_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            hex_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
