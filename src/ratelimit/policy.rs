//! Rate limit tiers, policies and bucket keys.

use std::fmt;
use std::time::Duration;

use crate::config::RateLimitRule;

/// Rate limit tier a request is counted against.
///
/// Unrestricted (admin) tokens have no tier because they never touch a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyTier {
    /// Keyed by client IP
    Unauthenticated,
    /// Keyed by token
    Metered,
}

impl PolicyTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyTier::Unauthenticated => "unauthenticated",
            PolicyTier::Metered => "metered",
        }
    }
}

/// Limit and window length for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Maximum requests allowed in the window
    pub limit: u64,
    /// Window length
    pub window: Duration,
}

impl From<RateLimitRule> for RateLimitPolicy {
    fn from(rule: RateLimitRule) -> Self {
        Self {
            limit: rule.requests_per_unit,
            window: rule.unit.duration(),
        }
    }
}

/// A key that uniquely identifies a rate limit window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub tier: PolicyTier,
    /// Client IP for the unauthenticated tier, token for the metered tier
    pub key: String,
}

impl BucketKey {
    pub fn new(tier: PolicyTier, key: impl Into<String>) -> Self {
        Self {
            tier,
            key: key.into(),
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tier.as_str(), self.key)
    }
}
