//! Request signing - canonical JSON + HMAC-SHA256.
//!
//! Authenticated request bodies carry `signature = hex(HMAC-SHA256(key =
//! credential, message = canonical_json(body minus signature)))`. The
//! backend recomputes the same digest, so both sides must agree on the
//! canonical form: object keys sorted lexicographically at every level,
//! no insignificant whitespace.

use crate::error::{EdgeError, EdgeResult};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Field name the signature travels under, inside the JSON body.
pub const SIGNATURE_FIELD: &str = "signature";

/// Canonical JSON serialization of a value.
///
/// serde_json's default object map is BTreeMap-backed, so any value
/// routed through `serde_json::Value` serializes with sorted keys; the
/// compact writer emits no insignificant whitespace.
pub fn canonical_json(value: &serde_json::Value) -> EdgeResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Hex HMAC-SHA256 of the canonical form of `value`, keyed with the
/// device credential.
pub fn sign(credential: &str, value: &serde_json::Value) -> EdgeResult<String> {
    let message = canonical_json(value)?;

    let mut mac = HmacSha256::new_from_slice(credential.as_bytes())
        .map_err(|e| EdgeError::Internal(format!("invalid HMAC key: {}", e)))?;
    mac.update(message.as_bytes());

    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Serialize a request, sign it, and attach the signature field.
pub fn signed_body<T: Serialize>(credential: &str, request: &T) -> EdgeResult<serde_json::Value> {
    let mut body = serde_json::to_value(request)?;
    let signature = sign(credential, &body)?;

    body.as_object_mut()
        .ok_or_else(|| EdgeError::Internal("signable body must be a JSON object".to_string()))?
        .insert(SIGNATURE_FIELD.to_string(), serde_json::Value::String(signature));

    Ok(body)
}

/// Check a signed body: recompute the signature over the body minus its
/// signature field and compare.
pub fn verify(credential: &str, body: &serde_json::Value) -> EdgeResult<bool> {
    let presented = match body.get(SIGNATURE_FIELD).and_then(|s| s.as_str()) {
        Some(s) => s.to_string(),
        None => return Ok(false),
    };

    let mut unsigned = body.clone();
    unsigned
        .as_object_mut()
        .ok_or_else(|| EdgeError::Internal("signed body must be a JSON object".to_string()))?
        .remove(SIGNATURE_FIELD);

    Ok(sign(credential, &unsigned)? == presented)
}
