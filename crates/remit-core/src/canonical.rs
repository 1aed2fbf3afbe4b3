//! Canonical JSON and digest helpers.
//!
//! Signatures are valid only over this exact serialization: object keys
//! recursively sorted, no added whitespace. Do not substitute a generic
//! serializer here; key ordering and whitespace must stay byte-stable
//! across every component that hashes or signs a payload.

use crate::error::RemitError;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize any value through the canonical form: sort object keys at
/// every depth, then JSON-encode compactly.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<String, RemitError> {
    let value = serde_json::to_value(value).map_err(|e| RemitError::Serialization(e.to_string()))?;
    let mut out = String::new();
    write_canonical(&value, &mut out);
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json handles string escaping; keys cannot fail.
                out.push_str(&serde_json::to_string(key).expect("string key encodes"));
                out.push(':');
                write_canonical(&map[key.as_str()], out);
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
        scalar => {
            out.push_str(&serde_json::to_string(scalar).expect("scalar encodes"));
        }
    }
}

/// Lowercase hex SHA-256 of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Chain-link hash: `SHA256(prev_hash ‖ bank_receipt_hash ‖ balance_after)`.
/// The separator keeps distinct field boundaries unambiguous.
pub fn chain_hash(prev_hash: &str, bank_receipt_hash: &str, balance_after_cents: i64) -> String {
    sha256_hex(format!("{prev_hash}|{bank_receipt_hash}|{balance_after_cents}").as_bytes())
}

/// Pairwise SHA-256 combine for Merkle interior nodes.
pub fn merkle_combine(left: &str, right: &str) -> String {
    sha256_hex(format!("{left}{right}").as_bytes())
}
