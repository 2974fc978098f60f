//! Request-Hash Binding
//! Mission: Bind mutating JSON bodies to the token that authorized them
//!
//! For mutating JSON requests the token must carry
//! `req_hash = "sha256:" + lowercase_hex(sha256(raw_body))`. The
//! middleware enforces, in order: JSON content type, identity (or
//! absent) content encoding (415 otherwise), a 1 MiB body cap (413),
//! claim format (400), and the body digest itself (400 on mismatch).
//! GET/HEAD and non-JSON bodies skip hash verification.

use crate::auth::models::{AuthError, Claims};
use axum::{
    body::{to_bytes, Body},
    extract::Request,
    http::{header, Method},
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};

/// Body cap for hash-guarded requests.
pub const MAX_GUARDED_BODY_BYTES: usize = 1024 * 1024;

const REQ_HASH_PREFIX: &str = "sha256:";
const SHA256_HEX_LEN: usize = 64;

/// `^sha256:[0-9a-f]{64}$` without pulling in a regex engine.
pub fn req_hash_format_valid(claim: &str) -> bool {
    let Some(hex_part) = claim.strip_prefix(REQ_HASH_PREFIX) else {
        return false;
    };
    hex_part.len() == SHA256_HEX_LEN
        && hex_part
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// The claim value for a raw body.
pub fn req_hash_of(body: &[u8]) -> String {
    format!("{}{}", REQ_HASH_PREFIX, hex::encode(Sha256::digest(body)))
}

fn is_json_content_type(value: &str) -> bool {
    let essence = value.split(';').next().unwrap_or("").trim();
    essence.eq_ignore_ascii_case("application/json")
        || essence
            .rsplit_once('+')
            .map(|(_, suffix)| suffix.eq_ignore_ascii_case("json"))
            .unwrap_or(false)
}

/// Middleware enforcing the body binding. Runs after token
/// verification; reads `Claims` from request extensions.
pub async fn req_hash_middleware(req: Request, next: Next) -> Result<Response, AuthError> {
    let method = req.method().clone();
    if method == Method::GET || method == Method::HEAD || method == Method::OPTIONS {
        return Ok(next.run(req).await);
    }

    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if !is_json_content_type(&content_type) {
        // Non-JSON bodies skip hash verification.
        return Ok(next.run(req).await);
    }

    if let Some(encoding) = req
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
    {
        if !encoding.eq_ignore_ascii_case("identity") {
            return Err(AuthError::ReqHashRequiresIdentityEncoding);
        }
    }

    if let Some(length) = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        if length > MAX_GUARDED_BODY_BYTES {
            return Err(AuthError::BodyTooLarge);
        }
    }

    let claim = match req.extensions().get::<Claims>() {
        Some(claims) => claims.req_hash.clone(),
        None => None,
    };
    let Some(claim) = claim else {
        return Err(AuthError::ReqHashFormatInvalid);
    };
    if !req_hash_format_valid(&claim) {
        return Err(AuthError::ReqHashFormatInvalid);
    }

    let (parts, body) = req.into_parts();
    let bytes = to_bytes(body, MAX_GUARDED_BODY_BYTES)
        .await
        .map_err(|_| AuthError::BodyTooLarge)?;

    if req_hash_of(&bytes) != claim {
        metrics::increment_counter!("req_hash_mismatch_total");
        return Err(AuthError::ReqHashMismatch);
    }

    let req = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_validation() {
        let good = format!("sha256:{}", "a".repeat(64));
        assert!(req_hash_format_valid(&good));

        assert!(!req_hash_format_valid(&"a".repeat(71)));
        assert!(!req_hash_format_valid(&format!("sha256:{}", "a".repeat(63))));
        assert!(!req_hash_format_valid(&format!("sha256:{}", "A".repeat(64)))); // uppercase
        assert!(!req_hash_format_valid(&format!("sha256:{}", "g".repeat(64)))); // non-hex
        assert!(!req_hash_format_valid(&format!("sha512:{}", "a".repeat(64))));
        assert!(!req_hash_format_valid(""));
    }

    #[test]
    fn test_req_hash_of_known_vector() {
        // sha256("") is the well-known empty digest.
        assert_eq!(
            req_hash_of(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        let h = req_hash_of(br#"{"text":"hello"}"#);
        assert!(req_hash_format_valid(&h));
    }

    #[test]
    fn test_json_content_type_detection() {
        assert!(is_json_content_type("application/json"));
        assert!(is_json_content_type("application/json; charset=utf-8"));
        assert!(is_json_content_type("application/vnd.api+json"));
        assert!(!is_json_content_type("text/plain"));
        assert!(!is_json_content_type("application/x-www-form-urlencoded"));
        assert!(!is_json_content_type(""));
    }

    #[test]
    fn test_pretty_printed_body_changes_hash() {
        let compact = br#"{"text":"hello"}"#;
        let pretty = b"{\n  \"text\": \"hello\"\n}";
        assert_ne!(req_hash_of(compact), req_hash_of(pretty));
    }
}
