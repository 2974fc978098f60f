//! Authentication Models
//! Mission: Claims and stable auth error codes for the serving edge

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// JWT claims accepted at the edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer, validated against configuration.
    pub iss: String,
    /// Audience, validated against configuration.
    pub aud: String,
    /// Tenant id.
    pub sub: String,
    /// Issued-at (seconds).
    pub iat: u64,
    /// Expiry (seconds).
    pub exp: u64,
    /// Token id for replay protection on WebSocket upgrades.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    /// Tenant tier: free | pro | enterprise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    /// Body binding for mutating JSON requests:
    /// `"sha256:" + lowercase_hex(sha256(raw_body))`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_hash: Option<String>,
}

/// Edge auth failures with stable wire codes. The response body is
/// always `{error, code}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
    ReplayedJti,
    ReqHashMismatch,
    ReqHashFormatInvalid,
    ReqHashRequiresIdentityEncoding,
    BodyTooLarge,
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingToken | AuthError::InvalidToken | AuthError::ReplayedJti => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::ReqHashMismatch | AuthError::ReqHashFormatInvalid => StatusCode::BAD_REQUEST,
            AuthError::ReqHashRequiresIdentityEncoding => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AuthError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    pub fn error(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::InvalidToken => "invalid_token",
            AuthError::ReplayedJti => "replayed_jti",
            AuthError::ReqHashMismatch => "req_hash_mismatch",
            AuthError::ReqHashFormatInvalid => "req_hash_format_invalid",
            AuthError::ReqHashRequiresIdentityEncoding => "req_hash_requires_identity_encoding",
            AuthError::BodyTooLarge => "body_too_large",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "AUTH_REQUIRED",
            AuthError::InvalidToken | AuthError::ReplayedJti => "AUTH_INVALID",
            AuthError::ReqHashMismatch => "REQ_HASH_MISMATCH",
            AuthError::ReqHashFormatInvalid => "REQ_HASH_FORMAT",
            AuthError::ReqHashRequiresIdentityEncoding => "REQ_HASH_REQUIRES_IDENTITY_ENCODING",
            AuthError::BodyTooLarge => "BODY_TOO_LARGE",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.error(),
            "code": self.code(),
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AuthError::MissingToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::InvalidToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::ReplayedJti.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::ReqHashMismatch.status(), StatusCode::BAD_REQUEST);
        assert_eq!(AuthError::ReqHashFormatInvalid.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AuthError::ReqHashRequiresIdentityEncoding.status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(AuthError::BodyTooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_stable_codes() {
        assert_eq!(AuthError::MissingToken.code(), "AUTH_REQUIRED");
        assert_eq!(AuthError::ReqHashMismatch.code(), "REQ_HASH_MISMATCH");
        assert_eq!(AuthError::ReqHashFormatInvalid.code(), "REQ_HASH_FORMAT");
        assert_eq!(AuthError::BodyTooLarge.code(), "BODY_TOO_LARGE");
    }

    #[test]
    fn test_claims_optional_fields() {
        let json = r#"{
            "iss": "https://auth.example",
            "aud": "agentry",
            "sub": "tenant-1",
            "iat": 1700000000,
            "exp": 1700003600
        }"#;
        let claims: Claims = serde_json::from_str(json).unwrap();
        assert!(claims.jti.is_none());
        assert!(claims.req_hash.is_none());
        assert_eq!(claims.sub, "tenant-1");
    }
}
