//! JWT Token Verification
//! Mission: Validate edge tokens against a TTL-cached JWKS

use crate::auth::models::Claims;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// Header carries no `kid`, or the JWKS has no matching key.
    UnknownKey,
    /// Signature, issuer, audience, or time-window check failed.
    Invalid,
    /// `exp - iat` exceeds the configured maximum lifetime, or `iat`
    /// sits in the future beyond the allowed skew.
    LifetimeViolation,
    /// JWKS could not be fetched and nothing usable was cached.
    JwksUnavailable,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::UnknownKey => write!(f, "no usable verification key"),
            VerifyError::Invalid => write!(f, "token failed validation"),
            VerifyError::LifetimeViolation => write!(f, "token lifetime outside policy"),
            VerifyError::JwksUnavailable => write!(f, "jwks unavailable"),
        }
    }
}

impl std::error::Error for VerifyError {}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: String,
    kty: String,
    #[serde(default)]
    n: String,
    #[serde(default)]
    e: String,
}

#[derive(Debug, Clone, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

struct CachedJwks {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

enum KeySource {
    /// Remote JWKS, cached with a TTL.
    Jwks {
        client: reqwest::Client,
        url: String,
        ttl: Duration,
        cached: RwLock<Option<CachedJwks>>,
    },
    /// Fixed key for tests and single-key deployments.
    Static { key: DecodingKey, alg: Algorithm },
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub issuer: String,
    pub audience: String,
    /// Allowed clock skew on iat/exp, seconds.
    pub leeway_secs: u64,
    /// Maximum `exp - iat`.
    pub max_token_lifetime: Duration,
}

impl Default for JwtConfig {
    fn default() -> Self {
        JwtConfig {
            issuer: "https://auth.agentry.dev".to_string(),
            audience: "agentry-gateway".to_string(),
            leeway_secs: 60,
            max_token_lifetime: Duration::from_secs(24 * 3600),
        }
    }
}

pub struct JwtVerifier {
    source: KeySource,
    config: JwtConfig,
}

impl JwtVerifier {
    pub fn from_jwks_url(url: String, jwks_ttl: Duration, config: JwtConfig) -> Self {
        JwtVerifier {
            source: KeySource::Jwks {
                client: reqwest::Client::new(),
                url,
                ttl: jwks_ttl,
                cached: RwLock::new(None),
            },
            config,
        }
    }

    /// Fixed-key verifier (HS256 shared secret).
    pub fn with_shared_secret(secret: &[u8], config: JwtConfig) -> Self {
        JwtVerifier {
            source: KeySource::Static {
                key: DecodingKey::from_secret(secret),
                alg: Algorithm::HS256,
            },
            config,
        }
    }

    async fn key_for(&self, token: &str) -> Result<(DecodingKey, Algorithm), VerifyError> {
        match &self.source {
            KeySource::Static { key, alg } => Ok((key.clone(), *alg)),
            KeySource::Jwks {
                client,
                url,
                ttl,
                cached,
            } => {
                let header = decode_header(token).map_err(|_| VerifyError::Invalid)?;
                let kid = header.kid.ok_or(VerifyError::UnknownKey)?;

                if let Some(entry) = cached.read().as_ref() {
                    if entry.fetched_at.elapsed() < *ttl {
                        return entry
                            .keys
                            .get(&kid)
                            .cloned()
                            .map(|k| (k, header.alg))
                            .ok_or(VerifyError::UnknownKey);
                    }
                }

                match Self::fetch_jwks(client, url).await {
                    Ok(keys) => {
                        let key = keys.get(&kid).cloned();
                        *cached.write() = Some(CachedJwks {
                            keys,
                            fetched_at: Instant::now(),
                        });
                        key.map(|k| (k, header.alg)).ok_or(VerifyError::UnknownKey)
                    }
                    Err(e) => {
                        warn!(error = %e, "jwks refresh failed; falling back to stale cache");
                        // A stale cache beats rejecting everyone.
                        cached
                            .read()
                            .as_ref()
                            .and_then(|entry| entry.keys.get(&kid).cloned())
                            .map(|k| (k, header.alg))
                            .ok_or(VerifyError::JwksUnavailable)
                    }
                }
            }
        }
    }

    async fn fetch_jwks(
        client: &reqwest::Client,
        url: &str,
    ) -> Result<HashMap<String, DecodingKey>, anyhow::Error> {
        let document: JwksDocument = client.get(url).send().await?.json().await?;
        let mut keys = HashMap::new();
        for jwk in document.keys {
            if jwk.kty != "RSA" {
                continue;
            }
            match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
                Ok(key) => {
                    keys.insert(jwk.kid, key);
                }
                Err(e) => warn!(kid = %jwk.kid, error = %e, "skipping unusable jwk"),
            }
        }
        debug!(keys = keys.len(), "jwks refreshed");
        Ok(keys)
    }

    /// Full verification: signature, iss, aud, exp/iat with skew, and
    /// the maximum-lifetime policy.
    pub async fn verify(&self, token: &str) -> Result<Claims, VerifyError> {
        let (key, alg) = self.key_for(token).await?;

        let mut validation = Validation::new(alg);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_audience(&[self.config.audience.as_str()]);
        validation.leeway = self.config.leeway_secs;
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let decoded =
            decode::<Claims>(token, &key, &validation).map_err(|_| VerifyError::Invalid)?;
        let claims = decoded.claims;

        let now = chrono::Utc::now().timestamp().max(0) as u64;
        if claims.iat > now + self.config.leeway_secs {
            return Err(VerifyError::LifetimeViolation);
        }
        if claims.exp.saturating_sub(claims.iat) > self.config.max_token_lifetime.as_secs() {
            return Err(VerifyError::LifetimeViolation);
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &[u8] = b"test-secret-key-12345";

    fn config() -> JwtConfig {
        JwtConfig {
            issuer: "https://auth.test".to_string(),
            audience: "agentry-test".to_string(),
            leeway_secs: 60,
            max_token_lifetime: Duration::from_secs(3600),
        }
    }

    fn token(claims: &Claims) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    fn claims(iat_offset: i64, lifetime_secs: u64) -> Claims {
        let now = chrono::Utc::now().timestamp();
        let iat = (now + iat_offset).max(0) as u64;
        Claims {
            iss: "https://auth.test".to_string(),
            aud: "agentry-test".to_string(),
            sub: "tenant-1".to_string(),
            iat,
            exp: iat + lifetime_secs,
            jti: Some("jti-1".to_string()),
            tier: Some("pro".to_string()),
            req_hash: None,
        }
    }

    #[tokio::test]
    async fn test_valid_token_verifies() {
        let verifier = JwtVerifier::with_shared_secret(SECRET, config());
        let verified = verifier.verify(&token(&claims(0, 600))).await.unwrap();
        assert_eq!(verified.sub, "tenant-1");
        assert_eq!(verified.tier.as_deref(), Some("pro"));
    }

    #[tokio::test]
    async fn test_wrong_issuer_rejected() {
        let verifier = JwtVerifier::with_shared_secret(SECRET, config());
        let mut c = claims(0, 600);
        c.iss = "https://evil.test".to_string();
        assert_eq!(verifier.verify(&token(&c)).await.unwrap_err(), VerifyError::Invalid);
    }

    #[tokio::test]
    async fn test_wrong_audience_rejected() {
        let verifier = JwtVerifier::with_shared_secret(SECRET, config());
        let mut c = claims(0, 600);
        c.aud = "other-service".to_string();
        assert_eq!(verifier.verify(&token(&c)).await.unwrap_err(), VerifyError::Invalid);
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let verifier = JwtVerifier::with_shared_secret(SECRET, config());
        let c = claims(-7200, 600); // expired an hour ago, beyond leeway
        assert_eq!(verifier.verify(&token(&c)).await.unwrap_err(), VerifyError::Invalid);
    }

    #[tokio::test]
    async fn test_excessive_lifetime_rejected() {
        let verifier = JwtVerifier::with_shared_secret(SECRET, config());
        let c = claims(0, 7 * 24 * 3600); // a week-long token
        assert_eq!(
            verifier.verify(&token(&c)).await.unwrap_err(),
            VerifyError::LifetimeViolation
        );
    }

    #[tokio::test]
    async fn test_future_iat_rejected() {
        let verifier = JwtVerifier::with_shared_secret(SECRET, config());
        let c = claims(600, 600); // issued 10 minutes in the future
        assert_eq!(
            verifier.verify(&token(&c)).await.unwrap_err(),
            VerifyError::LifetimeViolation
        );
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let verifier = JwtVerifier::with_shared_secret(b"other-secret", config());
        assert_eq!(
            verifier.verify(&token(&claims(0, 600))).await.unwrap_err(),
            VerifyError::Invalid
        );
    }

    #[tokio::test]
    async fn test_garbage_token_rejected() {
        let verifier = JwtVerifier::with_shared_secret(SECRET, config());
        assert!(verifier.verify("not.a.token").await.is_err());
    }
}
