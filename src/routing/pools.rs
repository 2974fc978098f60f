//! Pools and Tiers
//!
//! Pools are a closed vocabulary; the tier -> allowed-pools matrix is
//! fixed. Nothing downstream may widen a tier's access, whatever the
//! affinity ranking says.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed pool vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PoolId {
    #[serde(rename = "cheap")]
    Cheap,
    #[serde(rename = "fast-code")]
    FastCode,
    #[serde(rename = "reviewer")]
    Reviewer,
    #[serde(rename = "reasoning")]
    Reasoning,
    #[serde(rename = "architect")]
    Architect,
}

pub const ALL_POOLS: [PoolId; 5] = [
    PoolId::Cheap,
    PoolId::FastCode,
    PoolId::Reviewer,
    PoolId::Reasoning,
    PoolId::Architect,
];

impl PoolId {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolId::Cheap => "cheap",
            PoolId::FastCode => "fast-code",
            PoolId::Reviewer => "reviewer",
            PoolId::Reasoning => "reasoning",
            PoolId::Architect => "architect",
        }
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPool(pub String);

impl fmt::Display for UnknownPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown pool id: {}", self.0)
    }
}

impl std::error::Error for UnknownPool {}

impl FromStr for PoolId {
    type Err = UnknownPool;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cheap" => Ok(PoolId::Cheap),
            "fast-code" => Ok(PoolId::FastCode),
            "reviewer" => Ok(PoolId::Reviewer),
            "reasoning" => Ok(PoolId::Reasoning),
            "architect" => Ok(PoolId::Architect),
            other => Err(UnknownPool(other.to_string())),
        }
    }
}

/// Tenant plan class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }

    /// Fixed access matrix.
    pub fn allowed_pools(&self) -> &'static [PoolId] {
        match self {
            Tier::Free => &[PoolId::Cheap],
            Tier::Pro => &[PoolId::Cheap, PoolId::FastCode, PoolId::Reviewer],
            Tier::Enterprise => &ALL_POOLS,
        }
    }

    pub fn allows(&self, pool: PoolId) -> bool {
        self.allowed_pools().contains(&pool)
    }
}

impl FromStr for Tier {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            _ => Err(()),
        }
    }
}

/// Stable error codes for pool access checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolAccessError {
    /// Pool id outside the closed vocabulary.
    Unknown(String),
    /// Known pool, inaccessible at this tier.
    TierUnauthorized { pool: PoolId, tier: Tier },
}

impl PoolAccessError {
    pub fn code(&self) -> &'static str {
        match self {
            PoolAccessError::Unknown(_) => "UNKNOWN_POOL",
            PoolAccessError::TierUnauthorized { .. } => "TIER_UNAUTHORIZED",
        }
    }
}

impl fmt::Display for PoolAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolAccessError::Unknown(id) => write!(f, "unknown pool id: {}", id),
            PoolAccessError::TierUnauthorized { pool, tier } => {
                write!(f, "pool {} is not available on the {} tier", pool, tier.as_str())
            }
        }
    }
}

impl std::error::Error for PoolAccessError {}

/// Validate an explicitly requested pool against the tier matrix.
pub fn check_pool_access(tier: Tier, pool_id: &str) -> Result<PoolId, PoolAccessError> {
    let pool = PoolId::from_str(pool_id).map_err(|e| PoolAccessError::Unknown(e.0))?;
    if tier.allows(pool) {
        Ok(pool)
    } else {
        Err(PoolAccessError::TierUnauthorized { pool, tier })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_round_trip() {
        for pool in ALL_POOLS {
            assert_eq!(PoolId::from_str(pool.as_str()).unwrap(), pool);
        }
        assert!(PoolId::from_str("gpu-farm").is_err());
    }

    #[test]
    fn test_tier_matrix() {
        assert_eq!(Tier::Free.allowed_pools(), &[PoolId::Cheap]);
        assert_eq!(
            Tier::Pro.allowed_pools(),
            &[PoolId::Cheap, PoolId::FastCode, PoolId::Reviewer]
        );
        assert_eq!(Tier::Enterprise.allowed_pools(), &ALL_POOLS);
    }

    #[test]
    fn test_access_codes() {
        let err = check_pool_access(Tier::Free, "warp-drive").unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_POOL");

        let err = check_pool_access(Tier::Free, "architect").unwrap_err();
        assert_eq!(err.code(), "TIER_UNAUTHORIZED");

        assert_eq!(
            check_pool_access(Tier::Pro, "reviewer").unwrap(),
            PoolId::Reviewer
        );
        assert_eq!(
            check_pool_access(Tier::Enterprise, "architect").unwrap(),
            PoolId::Architect
        );
    }
}
