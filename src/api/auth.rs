//! Auth middleware (spec §6): `X-API-Key: ab_<hex>` (hash-verified) or
//! `Authorization: Bearer <jwt>` (HS256). API-key *issuance and storage*
//! is an external collaborator (spec.md §1); the process only verifies
//! the single operator-configured key hash plus the JWT signature.

use super::{ApiError, ApiState};
use crate::error::AuthError;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub async fn require_auth(State(state): State<Arc<ApiState>>, req: Request, next: Next) -> Result<Response, ApiError> {
    let headers = req.headers();

    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if verify_api_key(&state, key) {
            return Ok(next.run(req).await);
        }
        return Err(ApiError(AuthError::Invalid.into()));
    }

    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            if verify_jwt(&state.config.jwt_secret, token) {
                return Ok(next.run(req).await);
            }
            return Err(ApiError(AuthError::Invalid.into()));
        }
    }

    Err(ApiError(AuthError::Missing.into()))
}

fn verify_api_key(state: &ApiState, presented: &str) -> bool {
    let Some(expected_hash) = state.config.api_key_hash else { return false };
    let digest: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
    constant_time_eq(&digest, &expected_hash)
}

fn verify_jwt(secret: &str, token: &str) -> bool {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    if parts.next().is_some() {
        return false;
    }

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else { return false };
    mac.update(header.as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    let expected = mac.finalize().into_bytes();

    let Ok(given) = URL_SAFE_NO_PAD.decode(signature) else { return false };
    if !constant_time_eq(&expected, &given) {
        return false;
    }

    let Ok(payload_bytes) = URL_SAFE_NO_PAD.decode(payload) else { return false };
    let Ok(claims) = serde_json::from_slice::<serde_json::Value>(&payload_bytes) else { return false };
    match claims.get("exp").and_then(|v| v.as_u64()) {
        Some(exp) => now_unix() < exp,
        None => true,
    }
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_slices() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn verify_jwt_rejects_tampered_signature() {
        let secret = "test-secret-value";
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(r#"{"sub":"ops"}"#);
        let token = format!("{header}.{payload}.not-a-real-signature");
        assert!(!verify_jwt(secret, &token));
    }

    #[test]
    fn verify_jwt_accepts_correctly_signed_token() {
        let secret = "test-secret-value";
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(r#"{"sub":"ops"}"#);
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        let token = format!("{header}.{payload}.{signature}");
        assert!(verify_jwt(secret, &token));
    }

    #[test]
    fn verify_jwt_rejects_expired_token() {
        let secret = "test-secret-value";
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(r#"{"sub":"ops","exp":1}"#);
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        let token = format!("{header}.{payload}.{signature}");
        assert!(!verify_jwt(secret, &token));
    }
}
