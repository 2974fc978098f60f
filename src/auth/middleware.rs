//! Authentication Middleware
//! Mission: Gate API endpoints on verified JWTs

use crate::auth::jti::{JtiGuard, JtiOutcome};
use crate::auth::jwt::JwtVerifier;
use crate::auth::models::{AuthError, Claims};
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::debug;

/// Shared state for the auth layer.
#[derive(Clone)]
pub struct AuthState {
    pub verifier: Arc<JwtVerifier>,
    pub jti_guard: Arc<JtiGuard>,
}

fn is_websocket_upgrade(req: &Request) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Verify the bearer token (query `token=` for WebSockets, else the
/// Authorization header), burn the jti on upgrade requests, and stash
/// the claims in request extensions.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token_from_query = req.uri().query().and_then(|query| {
        query
            .split('&')
            .find(|pair| pair.starts_with("token="))
            .and_then(|pair| pair.split('=').nth(1))
            .map(|t| t.to_string())
    });

    let token_from_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|t| t.to_string());

    let token = token_from_query
        .or(token_from_header)
        .ok_or(AuthError::MissingToken)?;

    let claims = auth
        .verifier
        .verify(&token)
        .await
        .map_err(|e| {
            debug!(error = %e, "token rejected");
            AuthError::InvalidToken
        })?;

    // WebSocket upgrades are replayable by construction; require a
    // one-shot jti.
    if is_websocket_upgrade(&req) {
        let jti = claims.jti.as_deref().ok_or(AuthError::InvalidToken)?;
        match auth.jti_guard.check_and_burn(jti).await {
            JtiOutcome::Fresh => {}
            JtiOutcome::Replayed => return Err(AuthError::ReplayedJti),
        }
    }

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// Extract claims after `auth_middleware` has run.
pub fn extract_claims(req: &Request) -> Option<&Claims> {
    req.extensions().get::<Claims>()
}
