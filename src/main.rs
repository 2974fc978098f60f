//! Agentry - Inference Proxy & Billing Substrate for NFT Agents
//! Mission: Charge tenants for exactly what their agents consume
//!
//! Boot order: config, tracing, metrics, WAL replay into the ledger
//! projection, state wiring, background workers (DLQ replayer,
//! reconciliation pollers, nightly balance job), then the edge.

use agentry_backend::api::{self, AppState};
use agentry_backend::auth::{AuthState, JtiGuard, JwtConfig, JwtVerifier};
use agentry_backend::billing::cache::{Cache, MemoryCache};
use agentry_backend::billing::credit_notes::{X402Config, X402Gateway};
use agentry_backend::billing::dlq::DlqStore;
use agentry_backend::billing::dlq_replay::{DlqReplayer, ReplayConfig};
use agentry_backend::billing::ledger::JournalStore;
use agentry_backend::billing::pricing::PricingTable;
use agentry_backend::billing::reconcile::{HttpBudgetAuthority, ReconcileRegistry};
use agentry_backend::billing::reconcile_job::ReconcileJob;
use agentry_backend::billing::reserve::ReserveEngine;
use agentry_backend::billing::wal::{FileWal, WalSink};
use agentry_backend::orchestrator::{IdempotencyCache, NoTools};
use agentry_backend::providers::{
    BreakerConfig, CircuitBreaker, HttpModelProvider, HttpProviderConfig,
};
use agentry_backend::routing::AffinityTable;
use agentry_backend::Config;
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "agentry", about = "Inference proxy and billing substrate")]
struct Args {
    /// Listen port (overrides PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Prometheus exporter port; 0 disables the exporter.
    #[arg(long, default_value_t = 9100)]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "agentry_backend=info,agentry=info,tower_http=warn".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.metrics_port > 0 {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], args.metrics_port));
        if let Err(e) = builder.install() {
            warn!(error = %e, "metrics exporter unavailable; continuing without it");
        }
    }

    // WAL + ledger projection. The WAL is the authority; boot replays
    // it into memory.
    let wal: Arc<dyn WalSink> =
        Arc::new(FileWal::open(&config.wal_path).context("opening wal")?);
    let journal = Arc::new(JournalStore::open(wal.clone()).context("rebuilding ledger")?);
    info!(entries = journal.entry_count(), "ledger projection ready");

    // Cache capability. Deployments with a shared Redis plug a
    // Redis-backed implementation in here; the in-process cache gives
    // the same atomic semantics for a single-node gateway.
    let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());

    let dlq = Arc::new(DlqStore::new(cache.clone(), wal.clone(), config.dlq.clone()));
    let engine = Arc::new(ReserveEngine::new(
        cache.clone(),
        journal.clone(),
        dlq.clone(),
        config.reserve.clone(),
    ));
    let x402 = Arc::new(X402Gateway::new(
        cache.clone(),
        journal.clone(),
        config.x402_challenge_secret.clone().into_bytes(),
        X402Config {
            recipient: config.x402_recipient.clone(),
            chain_id: config.x402_chain_id,
            challenge_ttl: Duration::from_secs(600),
        },
    ));

    let pricing = Arc::new(match &config.pricing_path {
        Some(path) => PricingTable::load(path).context("loading pricing table")?,
        None => PricingTable::builtin(),
    });
    let affinity = Arc::new(match &config.affinity_path {
        Some(path) => AffinityTable::load(path).context("loading affinity table")?,
        None => AffinityTable::builtin(),
    });

    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
    let provider = Arc::new(
        HttpModelProvider::new(HttpProviderConfig {
            base_url: config.provider_base_url.clone(),
            api_key: config.provider_api_key.clone(),
            request_timeout: config.provider_timeout,
        })
        .context("building model provider client")?,
    );

    let authority = Arc::new(
        HttpBudgetAuthority::new(config.authority_base_url.clone(), config.authority_timeout)
            .context("building budget authority client")?,
    );
    let reconcile = Arc::new(ReconcileRegistry::new(authority, config.reconcile.clone()));

    let verifier = Arc::new(match &config.jwks_url {
        Some(url) => JwtVerifier::from_jwks_url(
            url.clone(),
            config.jwks_ttl,
            JwtConfig {
                issuer: config.jwt_issuer.clone(),
                audience: config.jwt_audience.clone(),
                leeway_secs: config.jwt_leeway_secs,
                max_token_lifetime: config.jwt_max_lifetime,
            },
        ),
        None => {
            warn!("no JWKS_URL configured; using shared-secret verification");
            JwtVerifier::with_shared_secret(
                config.jwt_shared_secret.as_bytes(),
                JwtConfig {
                    issuer: config.jwt_issuer.clone(),
                    audience: config.jwt_audience.clone(),
                    leeway_secs: config.jwt_leeway_secs,
                    max_token_lifetime: config.jwt_max_lifetime,
                },
            )
        }
    });
    let auth_state = AuthState {
        verifier,
        jti_guard: Arc::new(JtiGuard::new(cache.clone(), config.jti_ttl)),
    };

    let state = AppState {
        engine: engine.clone(),
        journal: journal.clone(),
        cache: cache.clone(),
        pricing,
        affinity,
        breaker,
        provider,
        x402,
        reconcile: reconcile.clone(),
        idempotency: Arc::new(IdempotencyCache::new(
            10_000,
            Duration::from_secs(15 * 60),
        )),
        tools: Arc::new(NoTools),
        limits: config.limits.clone(),
    };

    // Background workers.
    let replayer = Arc::new(DlqReplayer::new(dlq, engine, ReplayConfig::default()));
    tokio::spawn(replayer.run());
    tokio::spawn(reconcile.run());
    let job = Arc::new(ReconcileJob::new(
        journal,
        cache,
        config.reconcile_job_drift_alert.clone(),
    ));
    tokio::spawn(job.run());

    let app = api::router(state, auth_state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(addr = %addr, "agentry gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    Ok(())
}
