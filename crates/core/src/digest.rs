//! SHA-256 helpers.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hex SHA-256 of a value's JSON encoding.
///
/// Map-typed fields must be ordered (`BTreeMap`, or `serde_json::Map`
/// without `preserve_order`) for the digest to be stable.
pub fn json_digest<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    Ok(sha256_hex(&bytes))
}
