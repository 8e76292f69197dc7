//! Canonical content hashing.
//!
//! Run reproducibility and result idempotence both rest on one property: the
//! same logical JSON value hashes to the same digest no matter which process,
//! host, or language produced it. Canonicalization rules:
//!
//! - object keys are sorted recursively (byte order)
//! - array order is preserved
//! - numbers are rendered in their shortest round-trip JSON form
//! - strings are JSON-escaped UTF-8
//! - non-finite floats are rejected outright
//!
//! The digest is lowercase hex SHA-256 of the canonical UTF-8 bytes.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Fingerprint format version - increment when canonicalization changes.
pub const INPUT_HASH_VERSION: &str = "IH1";

#[derive(Debug)]
pub enum HashError {
    /// A float that cannot appear in canonical JSON (NaN, +/-inf).
    NonFinite,
    Serialization(serde_json::Error),
}

impl std::fmt::Display for HashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonFinite => write!(f, "non-finite number in payload"),
            Self::Serialization(e) => write!(f, "serialization error: {}", e),
        }
    }
}

impl std::error::Error for HashError {}

impl From<serde_json::Error> for HashError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

/// Render `value` in canonical form (sorted keys, shortest numbers).
pub fn canonical_json(value: &Value) -> Result<String, HashError> {
    let mut out = String::with_capacity(256);
    write_canonical(&mut out, value)?;
    Ok(out)
}

fn write_canonical(out: &mut String, value: &Value) -> Result<(), HashError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return Err(HashError::NonFinite);
                }
            }
            // serde_json renders integers verbatim and floats via the
            // shortest round-trip representation, which is the canonical
            // textual form shared with the other platforms.
            out.push_str(&n.to_string());
        }
        Value::String(s) => out.push_str(&serde_json::to_string(s)?),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(out, &map[key])?;
            }
            out.push('}');
        }
    }
    Ok(())
}

/// SHA-256 hex digest of the canonical form of `value`.
pub fn canonical_hash(value: &Value) -> Result<String, HashError> {
    let canonical = canonical_json(value)?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

/// Canonical hash of any serializable value, going through `serde_json::Value`.
pub fn hash_of<T: Serialize>(value: &T) -> Result<String, HashError> {
    let json = serde_json::to_value(value)?;
    canonical_hash(&json)
}

/// Stable position-to-bucket assignment.
///
/// First 8 bytes of SHA-256 over the UTF-8 position id, read as an unsigned
/// big-endian integer, reduced modulo `hash_mod`. Both fan-out and the worker
/// filter go through this function so every position lands in exactly one
/// task.
pub fn bucket_for(position_id: &str, hash_mod: u32) -> u32 {
    let digest = Sha256::digest(position_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(hash_mod.max(1))) as u32
}

/// Deterministic task id for a `(run, node, product, bucket)` cell.
pub fn task_id_for(run_id: &str, portfolio_node_id: &str, product_type: &str, bucket: u32) -> String {
    let key = format!("{}:{}:{}:{}", run_id, portfolio_node_id, product_type, bucket);
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..16])
}

/// Fingerprint of everything that fed a single pricer call.
///
/// The shocked payload is a pure function of the base snapshot and the
/// scenario id, so hashing `(base hash, scenario id)` covers it.
pub fn input_fingerprint(
    market_payload_hash: &str,
    position_hash: &str,
    instrument_hash: &str,
    pricer_version: &str,
    scenario_id: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(INPUT_HASH_VERSION.as_bytes());
    for part in [
        market_payload_hash,
        position_hash,
        instrument_hash,
        pricer_version,
        scenario_id,
    ] {
        hasher.update([0u8]);
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}
