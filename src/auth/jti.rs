//! JTI Replay Guard
//! Mission: One-shot token ids for WebSocket upgrades

use crate::billing::cache::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JtiOutcome {
    /// First sighting; the id is now burned.
    Fresh,
    /// Seen before, or the guard could not be consulted (fail closed).
    Replayed,
}

pub struct JtiGuard {
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl JtiGuard {
    pub fn new(cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        JtiGuard { cache, ttl }
    }

    /// Atomic set-if-not-exists on `jti:{jti}`. Cache unavailability
    /// is treated as a replay: the guard fails closed.
    pub async fn check_and_burn(&self, jti: &str) -> JtiOutcome {
        let key = format!("jti:{}", jti);
        match self.cache.set_nx(&key, "1", Some(self.ttl)).await {
            Ok(true) => JtiOutcome::Fresh,
            Ok(false) => JtiOutcome::Replayed,
            Err(e) => {
                warn!(error = %e, "jti guard unavailable; failing closed");
                metrics::increment_counter!("jti_guard_unavailable_total");
                JtiOutcome::Replayed
            }
        }
    }
}
