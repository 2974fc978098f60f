//! Personality-to-Pool Affinity
//!
//! Ranks pools for an agent by blending archetype affinity (how well
//! the agent's archetype matches a pool) with genotype affinity (the
//! mean of a per-pool subset of the agent's dial fingerprint):
//!
//! ```text
//! affinity = 0.6 * archetype + 0.4 * genotype
//! ```
//!
//! The table is immutable data loaded at startup with a checksum.
//! Unknown archetypes and missing dials default optimistically to
//! 0.5. Ranking intersects with the tier's allowed pools before
//! scoring, so tier escalation is structurally impossible.

use crate::routing::pools::{PoolId, Tier, ALL_POOLS};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

const ARCHETYPE_WEIGHT: f64 = 0.6;
const GENOTYPE_WEIGHT: f64 = 0.4;
const NEUTRAL_AFFINITY: f64 = 0.5;

/// An agent's routing-relevant personality surface.
#[derive(Debug, Clone, Default)]
pub struct PersonalityProfile {
    pub archetype: String,
    /// Dial fingerprint, values in [0, 1].
    pub dials: HashMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct PoolAffinityConfig {
    /// Dial names averaged for this pool's genotype affinity.
    #[serde(default)]
    dials: Vec<String>,
    /// Archetype name -> affinity in [0, 1].
    #[serde(default)]
    archetypes: HashMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct AffinityFile {
    #[serde(rename = "pool")]
    pools: HashMap<String, PoolAffinityConfig>,
}

#[derive(Debug)]
pub enum AffinityTableError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    UnknownPool(String),
}

impl fmt::Display for AffinityTableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AffinityTableError::Io(e) => write!(f, "affinity table io error: {}", e),
            AffinityTableError::Parse(e) => write!(f, "affinity table parse error: {}", e),
            AffinityTableError::UnknownPool(p) => {
                write!(f, "affinity table references unknown pool {}", p)
            }
        }
    }
}

impl std::error::Error for AffinityTableError {}

/// Immutable affinity data table.
#[derive(Debug, Clone)]
pub struct AffinityTable {
    pools: HashMap<PoolId, PoolAffinityConfig>,
    pub checksum: String,
}

impl AffinityTable {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, AffinityTableError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(AffinityTableError::Io)?;
        let table = Self::from_toml(&raw)?;
        info!(
            path = %path.as_ref().display(),
            checksum = %table.checksum,
            "loaded affinity table"
        );
        Ok(table)
    }

    pub fn from_toml(raw: &str) -> Result<Self, AffinityTableError> {
        let parsed: AffinityFile = toml::from_str(raw).map_err(AffinityTableError::Parse)?;
        let checksum = hex::encode(Sha256::digest(raw.as_bytes()));
        let mut pools = HashMap::new();
        for (name, config) in parsed.pools {
            let pool = PoolId::from_str(&name)
                .map_err(|_| AffinityTableError::UnknownPool(name.clone()))?;
            pools.insert(pool, config);
        }
        Ok(AffinityTable { pools, checksum })
    }

    pub fn builtin() -> Self {
        Self::from_toml(BUILTIN_AFFINITY).expect("builtin affinity table is valid")
    }

    fn archetype_affinity(&self, pool: PoolId, archetype: &str) -> f64 {
        self.pools
            .get(&pool)
            .and_then(|c| c.archetypes.get(archetype))
            .copied()
            .unwrap_or(NEUTRAL_AFFINITY)
    }

    fn genotype_affinity(&self, pool: PoolId, profile: &PersonalityProfile) -> f64 {
        let Some(config) = self.pools.get(&pool) else {
            return NEUTRAL_AFFINITY;
        };
        if config.dials.is_empty() {
            return NEUTRAL_AFFINITY;
        }
        let sum: f64 = config
            .dials
            .iter()
            .map(|dial| {
                profile
                    .dials
                    .get(dial)
                    .copied()
                    .unwrap_or(NEUTRAL_AFFINITY)
                    .clamp(0.0, 1.0)
            })
            .sum();
        sum / config.dials.len() as f64
    }

    /// Blended affinity in [0, 1].
    pub fn affinity(&self, pool: PoolId, profile: &PersonalityProfile) -> f64 {
        ARCHETYPE_WEIGHT * self.archetype_affinity(pool, &profile.archetype)
            + GENOTYPE_WEIGHT * self.genotype_affinity(pool, profile)
    }

    /// Ranked pool selection: the tier's allowed pools intersected
    /// with the tenant's resolved pools, sorted by descending
    /// affinity, ties broken by pool id ascending. The result is
    /// always a subset of the tier's allowed pools; an empty result
    /// means the caller must fail with `no_eligible_pool`.
    pub fn rank_pools(
        &self,
        tier: Tier,
        profile: &PersonalityProfile,
        resolved: &[PoolId],
    ) -> Vec<PoolId> {
        let mut scored: Vec<(PoolId, f64)> = tier
            .allowed_pools()
            .iter()
            .copied()
            .filter(|pool| resolved.contains(pool))
            .map(|pool| (pool, self.affinity(pool, profile)))
            .collect();
        scored.sort_by(|(a_pool, a), (b_pool, b)| {
            b.partial_cmp(a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a_pool.as_str().cmp(b_pool.as_str()))
        });
        scored.into_iter().map(|(pool, _)| pool).collect()
    }
}

/// Default affinity data. Dial subsets pick the personality axes that
/// predict fit for each serving class.
const BUILTIN_AFFINITY: &str = r#"
[pool.cheap]
dials = []

[pool.cheap.archetypes]

[pool.fast-code]
dials = ["assertiveness", "precision", "tempo"]

[pool.fast-code.archetypes]
builder = 0.9
trickster = 0.6
sage = 0.4

[pool.reviewer]
dials = ["skepticism", "precision"]

[pool.reviewer.archetypes]
sage = 0.9
guardian = 0.8
builder = 0.5

[pool.reasoning]
dials = ["curiosity", "patience"]

[pool.reasoning.archetypes]
sage = 0.9
oracle = 0.9
builder = 0.6

[pool.architect]
dials = ["creativity", "vision", "curiosity"]

[pool.architect.archetypes]
visionary = 0.95
oracle = 0.8
builder = 0.7
"#;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(archetype: &str, dials: &[(&str, f64)]) -> PersonalityProfile {
        PersonalityProfile {
            archetype: archetype.to_string(),
            dials: dials.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    #[test]
    fn test_affinity_blend_weights() {
        let table = AffinityTable::builtin();
        // visionary on architect: archetype 0.95; dials creativity=1.0,
        // vision=1.0, curiosity=1.0 -> genotype 1.0.
        let p = profile(
            "visionary",
            &[("creativity", 1.0), ("vision", 1.0), ("curiosity", 1.0)],
        );
        let a = table.affinity(PoolId::Architect, &p);
        assert!((a - (0.6 * 0.95 + 0.4 * 1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_keys_default_neutral() {
        let table = AffinityTable::builtin();
        let p = profile("freshly-invented-archetype", &[]);
        // Unknown archetype -> 0.5; missing dials -> 0.5 each.
        let a = table.affinity(PoolId::FastCode, &p);
        assert!((a - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_free_tier_cannot_escalate() {
        let table = AffinityTable::builtin();
        // Affinity screams architect; tier says cheap only.
        let p = profile(
            "visionary",
            &[("creativity", 0.99), ("vision", 0.99), ("curiosity", 0.99)],
        );
        let ranked = table.rank_pools(Tier::Free, &p, &ALL_POOLS);
        assert_eq!(ranked, vec![PoolId::Cheap]);
    }

    #[test]
    fn test_free_tier_architect_0_99_returns_exactly_cheap() {
        // Free-tier tenant whose affinity vector assigns
        // architect = 0.99; the returned list is exactly ["cheap"].
        let table = AffinityTable::from_toml(
            r#"
            [pool.cheap]
            dials = []

            [pool.architect]
            dials = []
            [pool.architect.archetypes]
            architect = 0.99
            "#,
        )
        .unwrap();
        let p = profile("architect", &[]);

        // The architect pool really is the affinity winner...
        assert!(table.affinity(PoolId::Architect, &p) > table.affinity(PoolId::Cheap, &p));

        // ...and still cannot leak past the free tier.
        let ranked = table.rank_pools(Tier::Free, &p, &ALL_POOLS);
        assert_eq!(ranked, vec![PoolId::Cheap]);
    }

    #[test]
    fn test_subset_property_for_all_tiers() {
        let table = AffinityTable::builtin();
        let profiles = [
            profile("visionary", &[("creativity", 1.0)]),
            profile("builder", &[("assertiveness", 0.9), ("precision", 0.1)]),
            profile("", &[]),
        ];
        for tier in [Tier::Free, Tier::Pro, Tier::Enterprise] {
            for p in &profiles {
                let ranked = table.rank_pools(tier, p, &ALL_POOLS);
                for pool in &ranked {
                    assert!(tier.allows(*pool), "{:?} leaked {}", tier, pool);
                }
            }
        }
    }

    #[test]
    fn test_empty_intersection_returns_empty() {
        let table = AffinityTable::builtin();
        let p = profile("builder", &[]);
        // Tenant resolves only pools the tier does not allow.
        let ranked = table.rank_pools(Tier::Free, &p, &[PoolId::Architect, PoolId::Reasoning]);
        assert!(ranked.is_empty());

        // Empty resolved set: same.
        let ranked = table.rank_pools(Tier::Enterprise, &p, &[]);
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_ranking_descending_with_tie_break() {
        let table = AffinityTable::from_toml(
            r#"
            [pool.cheap]
            dials = []
            [pool.cheap.archetypes]
            builder = 0.8

            [pool.fast-code]
            dials = []
            [pool.fast-code.archetypes]
            builder = 0.8

            [pool.reviewer]
            dials = []
            [pool.reviewer.archetypes]
            builder = 0.9
            "#,
        )
        .unwrap();
        let p = profile("builder", &[]);
        let ranked = table.rank_pools(
            Tier::Pro,
            &p,
            &[PoolId::Cheap, PoolId::FastCode, PoolId::Reviewer],
        );
        // reviewer (0.9) first; cheap and fast-code tie at 0.8 and
        // break ascending by id ("cheap" < "fast-code").
        assert_eq!(ranked, vec![PoolId::Reviewer, PoolId::Cheap, PoolId::FastCode]);
    }

    #[test]
    fn test_table_rejects_unknown_pool() {
        let err = AffinityTable::from_toml(
            r#"
            [pool.warp-drive]
            dials = []
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, AffinityTableError::UnknownPool(_)));
    }
}
