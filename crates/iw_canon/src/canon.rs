//! Canonical JSON encoding and SHA-256 fingerprinting.
//!
//! Canonical form: object keys sorted lexicographically at every level,
//! ASCII-only escapement (every non-ASCII scalar value is emitted as a
//! `\uXXXX` escape, surrogate pairs for codepoints above the BMP), and
//! the minimal separators `,` and `:` with no surrounding whitespace.
//! This mirrors `json.dumps(obj, ensure_ascii=True, separators=(",",":"),
//! sort_keys=True)` from the reference implementation bit for bit.

use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// Serialize a JSON value into canonical bytes.
///
/// Fails with `CoreError::Validation` if the value contains a float that
/// cannot round-trip through JSON (NaN, +/-Infinity) -- such values never
/// appear in a `serde_json::Value` built through ordinary construction,
/// but can arrive via `serde_json::Number::from_f64` callers who skip the
/// `None` check, so we re-validate defensively here.
pub fn canonical_json_bytes(value: &serde_json::Value) -> Result<Vec<u8>, CoreError> {
    let mut out = String::new();
    write_value(value, &mut out)?;
    Ok(out.into_bytes())
}

/// SHA-256 of `bytes`, lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// Fingerprint of a JSON value: SHA-256 hex of its canonical bytes.
pub fn fingerprint_json(value: &serde_json::Value) -> Result<String, CoreError> {
    Ok(sha256_hex(&canonical_json_bytes(value)?))
}

/// Fingerprint any serializable value by first converting it to
/// `serde_json::Value` via `serde_json::to_value`.
pub fn fingerprint<T: serde::Serialize>(value: &T) -> Result<String, CoreError> {
    let v = serde_json::to_value(value)
        .map_err(|e| CoreError::internal(format!("failed to serialize value: {e}")))?;
    fingerprint_json(&v)
}

/// First `n` hex characters of a fingerprint. Used for truncated ids
/// (session ids, selectable item ids).
pub fn truncated_fingerprint(value: &serde_json::Value, n: usize) -> Result<String, CoreError> {
    let full = fingerprint_json(value)?;
    Ok(full.chars().take(n).collect())
}

/// Fingerprint over a raw string, matching the original's `"a|" + author_key`
/// style discriminator-prefixed hashing (used for author/book item ids,
/// which are fingerprints of *strings*, not structured JSON documents).
pub fn fingerprint_str(s: &str) -> String {
    sha256_hex(s.as_bytes())
}

fn write_value(value: &serde_json::Value, out: &mut String) -> Result<(), CoreError> {
    match value {
        serde_json::Value::Null => out.push_str("null"),
        serde_json::Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        serde_json::Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return Err(CoreError::validation(
                        "$",
                        "non_finite_float",
                        "value cannot be canonicalized: not finite",
                    ));
                }
            }
            out.push_str(&n.to_string());
        }
        serde_json::Value::String(s) => write_ascii_string(s, out),
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_ascii_string(key, out);
                out.push(':');
                write_value(&map[*key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_ascii_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c if (c as u32) < 0x7f => out.push(c),
            c => {
                let cp = c as u32;
                if cp <= 0xffff {
                    out.push_str(&format!("\\u{:04x}", cp));
                } else {
                    // Surrogate pair for codepoints above the BMP.
                    let v = cp - 0x10000;
                    let high = 0xd800 + (v >> 10);
                    let low = 0xdc00 + (v & 0x3ff);
                    out.push_str(&format!("\\u{:04x}\\u{:04x}", high, low));
                }
            }
        }
    }
    out.push('"');
}

/// ASCII-coerce a label: non-ASCII characters become `?`, matching the
/// original's selectable-item label rendering.
pub fn ascii_coerce(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii() { c } else { '?' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys() {
        let v = json!({"b": 1, "a": 2});
        let bytes = canonical_json_bytes(&v).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn escapes_non_ascii() {
        let v = json!({"name": "caf\u{e9}"});
        let bytes = canonical_json_bytes(&v).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"name":"caf\u00e9"}"#);
    }

    #[test]
    fn minimal_separators() {
        let v = json!([1, 2, 3]);
        let bytes = canonical_json_bytes(&v).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "[1,2,3]");
    }

    #[test]
    fn determinism_across_reparse() {
        let v = json!({"z": [1, {"y": "x"}], "a": null, "n": 3.5});
        let bytes1 = canonical_json_bytes(&v).unwrap();
        let reparsed: serde_json::Value = serde_json::from_slice(&bytes1).unwrap();
        let bytes2 = canonical_json_bytes(&reparsed).unwrap();
        assert_eq!(bytes1, bytes2);
    }

    #[test]
    fn fingerprint_is_stable() {
        let v = json!({"a": 1, "b": 2});
        let fp1 = fingerprint_json(&v).unwrap();
        let fp2 = fingerprint_json(&v).unwrap();
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 64);
        assert!(fp1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn ascii_coerce_replaces_non_ascii() {
        assert_eq!(ascii_coerce("caf\u{e9}"), "caf?");
        assert_eq!(ascii_coerce("plain"), "plain");
    }
}
