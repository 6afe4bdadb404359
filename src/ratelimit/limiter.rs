//! Tiered admission controller.

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::counter::RateLimitWindow;
use super::policy::{BucketKey, PolicyTier, RateLimitPolicy};
use crate::config::RateLimitingConfig;
use crate::entitlement::{AccessLevel, EntitlementCache};
use crate::error::{GatewayError, Result};
use crate::ledger::RequestContext;

/// Classifies requests by access level and applies the matching
/// fixed-window limit.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct AdmissionController {
    cache: Arc<EntitlementCache>,
    /// Rate limit windows indexed by tier and key
    windows: DashMap<BucketKey, RateLimitWindow>,
    unauthenticated: RateLimitPolicy,
    metered: RateLimitPolicy,
}

impl AdmissionController {
    /// Create a new admission controller.
    pub fn new(cache: Arc<EntitlementCache>, config: &RateLimitingConfig) -> Self {
        Self {
            cache,
            windows: DashMap::new(),
            unauthenticated: config.unauthenticated.into(),
            metered: config.metered.into(),
        }
    }

    /// Decide whether a request may proceed.
    ///
    /// Requests without a token, or whose token does not resolve to an
    /// admin or metered entitlement, share the unauthenticated limit for
    /// their client IP. Admin tokens bypass limiting entirely.
    pub async fn admit(&self, token: Option<&str>, client_ip: IpAddr) -> Result<RequestContext> {
        let access_level = match token {
            Some(token) => self.cache.lookup(token).await.map(|e| e.access_level),
            None => None,
        };

        let (context, bucket, policy) = match (token, access_level) {
            (Some(token), Some(AccessLevel::Unrestricted)) => {
                trace!("Unrestricted token admitted");
                return Ok(RequestContext::new(
                    Some(token.to_string()),
                    AccessLevel::Unrestricted,
                ));
            }
            (Some(token), Some(AccessLevel::Metered)) => (
                RequestContext::new(Some(token.to_string()), AccessLevel::Metered),
                BucketKey::new(PolicyTier::Metered, token),
                self.metered,
            ),
            _ => (
                RequestContext::unauthenticated(),
                BucketKey::new(PolicyTier::Unauthenticated, client_ip.to_string()),
                self.unauthenticated,
            ),
        };

        self.check_window(bucket, policy)?;
        Ok(context)
    }

    /// Count one hit against a window, creating or resetting it as needed.
    fn check_window(&self, bucket: BucketKey, policy: RateLimitPolicy) -> Result<()> {
        let now = Instant::now();
        let mut window = self
            .windows
            .entry(bucket.clone())
            .or_insert_with(|| RateLimitWindow::new(policy.limit, policy.window, now));

        if window.increment(1, now) {
            trace!(
                bucket = %bucket,
                count = window.current_count(),
                remaining = window.remaining(),
                "Request within rate limit"
            );
            return Ok(());
        }

        let retry_after = window.duration_until_reset(now);
        debug!(
            bucket = %bucket,
            limit = window.limit(),
            retry_after_ms = retry_after.as_millis() as u64,
            "Rate limit exceeded"
        );
        Err(GatewayError::RateLimited { retry_after })
    }

    /// Drop windows whose period has elapsed. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired(now));
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed, remaining = self.windows.len(), "Pruned expired rate limit windows");
        }
        removed
    }

    /// Get the current count for a window.
    ///
    /// Returns `None` if no window exists for the key.
    pub fn counter_value(&self, tier: PolicyTier, key: &str) -> Option<u64> {
        self.windows
            .get(&BucketKey::new(tier, key))
            .map(|w| w.current_count())
    }

    /// Get the number of active windows.
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}
