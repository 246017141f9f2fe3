//! Evaluation poll endpoints.
//!
//! GET variants carry the user as a base64 path segment; REPORT variants
//! carry it as the JSON request body. The `evalx` routes return the full
//! per-flag detail; the legacy routes return bare values.

use crate::config::parse_bool_param;
use crate::credentials::SdkKind;
use crate::dispatch::{RelayBody, RequestContext};
use crate::errors::RelayError;
use crate::evaluator::{BasicEvaluator, evaluate_all};
use base64::Engine;
use hmac::{Hmac, Mac};
use hyper::{Method, Response};
use serde_json::Value;
use sha2::Sha256;

use super::utils::json_response;

pub fn evaluate_handler(
    ctx: &RequestContext,
    full: bool,
) -> Result<Response<RelayBody>, RelayError> {
    let user = decode_user(ctx)?;

    if ctx.kind == SdkKind::Js && ctx.env.is_secure_mode() {
        verify_secure_mode_hash(ctx, &user)?;
    }

    let with_reasons = ctx
        .query
        .get("withReasons")
        .is_some_and(|v| parse_bool_param(v));

    let store = ctx.env.store()?;
    let response = evaluate_all(&BasicEvaluator, &store, &user, !full, with_reasons);
    Ok(json_response(&response))
}

fn decode_user(ctx: &RequestContext) -> Result<Value, RelayError> {
    let raw: Vec<u8> = if ctx.method == Method::GET {
        let encoded = ctx
            .params
            .get("user")
            .ok_or_else(|| RelayError::BadRequest("missing user".into()))?;
        decode_base64(encoded)
            .ok_or_else(|| RelayError::BadRequest("user data is not valid base64".into()))?
    } else {
        ctx.body.to_vec()
    };

    let user: Value = serde_json::from_slice(&raw)
        .map_err(|_| RelayError::BadRequest("user data is not valid JSON".into()))?;
    if !user["key"].is_string() {
        return Err(RelayError::BadRequest("user is missing a key".into()));
    }
    Ok(user)
}

/// SDKs disagree on the base64 alphabet and padding of the user segment, so
/// accept all four combinations.
fn decode_base64(encoded: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
    STANDARD
        .decode(encoded)
        .or_else(|_| STANDARD_NO_PAD.decode(encoded))
        .or_else(|_| URL_SAFE.decode(encoded))
        .or_else(|_| URL_SAFE_NO_PAD.decode(encoded))
        .ok()
}

/// In secure mode, a browser client must present an HMAC of its user key
/// computed with the environment's SDK key.
fn verify_secure_mode_hash(ctx: &RequestContext, user: &Value) -> Result<(), RelayError> {
    let presented = ctx.query.get("h").ok_or(RelayError::NoCredential)?;
    let user_key = user["key"].as_str().unwrap_or("");
    let expected = secure_mode_hash(&ctx.env.credentials().sdk_key, user_key);
    if *presented == expected {
        Ok(())
    } else {
        Err(RelayError::NoCredential)
    }
}

pub fn secure_mode_hash(sdk_key: &str, user_key: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(sdk_key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(user_key.as_bytes());
    let digest = mac.finalize().into_bytes();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_variants_decode() {
        let user = r#"{"key":"user?1"}"#;
        use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
        for encoded in [STANDARD.encode(user), URL_SAFE_NO_PAD.encode(user)] {
            assert_eq!(decode_base64(&encoded).unwrap(), user.as_bytes());
        }
        assert!(decode_base64("!!!not-base64!!!").is_none());
    }

    #[test]
    fn secure_mode_hash_is_stable_hex() {
        let hash = secure_mode_hash("sdk-key", "user-key");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        // deterministic
        assert_eq!(hash, secure_mode_hash("sdk-key", "user-key"));
        // sensitive to both inputs
        assert_ne!(hash, secure_mode_hash("sdk-key", "other-user"));
        assert_ne!(hash, secure_mode_hash("other-key", "user-key"));
    }
}
