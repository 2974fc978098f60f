//! Shared Configuration
//! Mission: One place where the environment becomes typed settings

use crate::billing::dlq::DlqConfig;
use crate::billing::money::{BasisPoints, MicroUsd};
use crate::billing::reconcile::ReconcileConfig;
use crate::billing::reserve::ReserveConfig;
use crate::orchestrator::OrchestratorLimits;
use std::time::Duration;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_micro(key: &str, default: i64) -> MicroUsd {
    std::env::var(key)
        .ok()
        .and_then(|v| MicroUsd::parse_canonical(&v).ok())
        .unwrap_or_else(|| MicroUsd::from_i64(default))
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub wal_path: String,
    /// Optional pricing/affinity table files; built-ins otherwise.
    pub pricing_path: Option<String>,
    pub affinity_path: Option<String>,

    // Edge auth
    pub jwks_url: Option<String>,
    pub jwks_ttl: Duration,
    /// Dev fallback when no JWKS is configured.
    pub jwt_shared_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub jwt_leeway_secs: u64,
    pub jwt_max_lifetime: Duration,
    pub jti_ttl: Duration,

    // Model provider
    pub provider_base_url: String,
    pub provider_api_key: String,
    pub provider_timeout: Duration,

    // Budget authority
    pub authority_base_url: String,
    pub authority_timeout: Duration,

    // x402
    pub x402_recipient: String,
    pub x402_chain_id: u64,
    pub x402_challenge_secret: String,

    pub reserve: ReserveConfig,
    pub dlq: DlqConfig,
    pub reconcile: ReconcileConfig,
    pub limits: OrchestratorLimits,
    pub reconcile_job_drift_alert: MicroUsd,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let reserve = ReserveConfig {
            reserve_ttl: Duration::from_secs(env_parse("RESERVE_TTL_SECS", 600u64)),
            finalize_claim_ttl: Duration::from_secs(env_parse("FINALIZE_CLAIM_TTL_SECS", 30u64)),
        };

        let dlq = DlqConfig {
            prefix: env_string("DLQ_PREFIX", "dlq"),
            max_retries: env_parse("DLQ_MAX_RETRIES", 5u32),
            claim_ttl: Duration::from_secs(env_parse("DLQ_CLAIM_TTL_SECS", 30u64)),
            backoff_base: Duration::from_secs(env_parse("DLQ_BACKOFF_BASE_SECS", 5u64)),
            backoff_max: Duration::from_secs(env_parse("DLQ_BACKOFF_MAX_SECS", 900u64)),
            jitter_pct: env_parse("DLQ_JITTER_PCT", 0.2f64),
        };

        let reconcile = ReconcileConfig {
            poll_interval: Duration::from_millis(env_parse("RECONCILE_POLL_INTERVAL_MS", 30_000u64)),
            configured_threshold: env_micro("RECONCILE_DRIFT_THRESHOLD_MICRO", 10_000),
            headroom_percent: BasisPoints::new(env_parse("RECONCILE_HEADROOM_BPS", 1_000i64))
                .unwrap_or_else(|_| BasisPoints::new(1_000).expect("1000 bps is in range")),
            headroom_abs_cap: env_micro("RECONCILE_HEADROOM_CAP_MICRO", 10_000_000),
            fail_open_max_duration: Duration::from_millis(env_parse(
                "RECONCILE_FAIL_OPEN_MAX_MS",
                300_000u64,
            )),
            unknown_limit_headroom: env_micro("RECONCILE_UNKNOWN_LIMIT_HEADROOM_MICRO", 100_000),
        };

        let limits = OrchestratorLimits {
            max_iterations: env_parse("ORCH_MAX_ITERATIONS", 8u32),
            max_total_tool_calls: env_parse("ORCH_MAX_TOOL_CALLS", 32u32),
            max_wall_time: Duration::from_millis(env_parse("ORCH_MAX_WALL_TIME_MS", 120_000u64)),
            abort_on_consecutive_failures: env_parse("ORCH_ABORT_CONSECUTIVE_FAILURES", 3u32),
        };

        Ok(Config {
            port: env_parse("PORT", 8080u16),
            wal_path: env_string("WAL_PATH", "./data/agentry.wal"),
            pricing_path: std::env::var("PRICING_TABLE_PATH").ok(),
            affinity_path: std::env::var("AFFINITY_TABLE_PATH").ok(),

            jwks_url: std::env::var("JWKS_URL").ok(),
            jwks_ttl: Duration::from_secs(env_parse("JWKS_TTL_SECS", 600u64)),
            jwt_shared_secret: env_string("JWT_SHARED_SECRET", "dev-secret-change-me"),
            jwt_issuer: env_string("JWT_ISSUER", "https://auth.agentry.dev"),
            jwt_audience: env_string("JWT_AUDIENCE", "agentry-gateway"),
            jwt_leeway_secs: env_parse("JWT_LEEWAY_SECS", 60u64),
            jwt_max_lifetime: Duration::from_secs(env_parse("JWT_MAX_LIFETIME_SECS", 86_400u64)),
            jti_ttl: Duration::from_secs(env_parse("JTI_TTL_SECS", 900u64)),

            provider_base_url: env_string("PROVIDER_BASE_URL", "https://openrouter.ai/api/v1"),
            provider_api_key: env_string("PROVIDER_API_KEY", ""),
            provider_timeout: Duration::from_secs(env_parse("PROVIDER_TIMEOUT_SECS", 120u64)),

            authority_base_url: env_string("AUTHORITY_BASE_URL", "http://localhost:9090"),
            authority_timeout: Duration::from_secs(env_parse("AUTHORITY_TIMEOUT_SECS", 5u64)),

            x402_recipient: env_string(
                "X402_RECIPIENT",
                "0x0000000000000000000000000000000000000000",
            ),
            x402_chain_id: env_parse("X402_CHAIN_ID", 8453u64),
            x402_challenge_secret: env_string("X402_CHALLENGE_SECRET", "dev-challenge-secret"),

            reserve,
            dlq,
            reconcile,
            limits,
            reconcile_job_drift_alert: env_micro("RECONCILE_JOB_DRIFT_ALERT_MICRO", 1_000_000),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = Config::from_env().unwrap();
        assert!(config.port > 0);
        assert_eq!(config.dlq.max_retries, 5);
        assert_eq!(config.reconcile.headroom_percent.value(), 1_000);
        assert!(config.limits.max_iterations > 0);
        assert_eq!(config.authority_timeout, Duration::from_secs(5));
    }
}
