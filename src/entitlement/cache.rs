//! TTL-bounded token entitlement cache.
//!
//! The cache is read on every request and refreshed wholesale from the
//! source of truth when its watermark goes stale or a token misses. A failed
//! refresh never fails a lookup: known tokens keep their last-known
//! entitlement and unknown tokens resolve to `None`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::source::{AccessLevel, SourceOfTruth};
use crate::config::EntitlementConfig;
use crate::error::{GatewayError, Result};

/// What a request is entitled to, as far as this gateway knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entitlement {
    pub access_level: AccessLevel,
    pub credit_balance: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    access_level: AccessLevel,
    credit_balance: u64,
    expires_at: Instant,
}

impl CacheEntry {
    fn entitlement(&self) -> Entitlement {
        Entitlement {
            access_level: self.access_level,
            credit_balance: self.credit_balance,
        }
    }
}

/// Outcome of a local balance decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deduction {
    /// The cost was subtracted; `remaining` is the new cached balance.
    Applied { remaining: u64 },
    /// The cost exceeds the cached balance; nothing was written.
    Overdraft { balance: u64 },
    /// The token is no longer cached; nothing was written.
    Missing,
}

#[derive(Debug, Default)]
struct RefreshState {
    /// Monotonic time of the last successful bulk refresh
    watermark: Option<Instant>,
    /// Wall-clock time of the same refresh, for reporting
    refreshed_at: Option<DateTime<Utc>>,
    /// When the last refresh attempt started, successful or not
    last_attempt: Option<Instant>,
}

/// Process-wide token → entitlement cache.
pub struct EntitlementCache {
    source: Arc<dyn SourceOfTruth>,
    entries: DashMap<String, CacheEntry>,
    state: RwLock<RefreshState>,
    /// Serializes bulk loads
    refresh_lock: tokio::sync::Mutex<()>,
    ttl: Duration,
    refresh_timeout: Duration,
    retry_backoff: Duration,
}

impl EntitlementCache {
    /// Create an empty cache. Nothing is loaded until the first lookup or
    /// an explicit [`force_refresh`](Self::force_refresh).
    pub fn new(source: Arc<dyn SourceOfTruth>, config: &EntitlementConfig) -> Self {
        Self {
            source,
            entries: DashMap::new(),
            state: RwLock::new(RefreshState::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
            ttl: config.ttl(),
            refresh_timeout: config.refresh_timeout(),
            retry_backoff: config.retry_backoff(),
        }
    }

    /// Resolve a token's entitlement, refreshing from the source of truth on
    /// a miss or when the watermark is stale.
    pub async fn lookup(&self, token: &str) -> Option<Entitlement> {
        let now = Instant::now();
        let fresh_hit = self
            .entries
            .get(token)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.entitlement());

        if let Some(entitlement) = fresh_hit {
            if self.watermark_is_fresh(now) {
                return Some(entitlement);
            }
        }

        if self.refresh_due(now) {
            if let Err(e) = self.refresh(false).await {
                trace!(error = %e, "Lookup refresh failed, serving cached entitlements");
            }
        }

        let entitlement = self.entries.get(token).map(|entry| entry.entitlement());
        if entitlement.is_none() {
            debug!("Token has no entitlement, treating as unauthenticated");
        }
        entitlement
    }

    /// Refresh the cache now, waiting behind any refresh already in flight.
    ///
    /// Returns the number of entitlements loaded.
    pub async fn force_refresh(&self) -> Result<usize> {
        self.refresh(true).await
    }

    /// Cached balance for a token, without triggering a refresh.
    pub fn balance(&self, token: &str) -> Option<u64> {
        self.entries.get(token).map(|entry| entry.credit_balance)
    }

    /// Subtract `cost` from a token's cached balance if it covers it.
    ///
    /// The read and the write happen under the entry's shard lock, so
    /// concurrent deductions on the same token can never take the balance
    /// below zero.
    pub fn apply_deduction(&self, token: &str, cost: u64) -> Deduction {
        let Some(mut entry) = self.entries.get_mut(token) else {
            return Deduction::Missing;
        };
        match entry.credit_balance.checked_sub(cost) {
            Some(remaining) => {
                entry.credit_balance = remaining;
                Deduction::Applied { remaining }
            }
            None => Deduction::Overdraft {
                balance: entry.credit_balance,
            },
        }
    }

    /// Number of cached tokens.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wall-clock time of the last successful bulk refresh.
    pub fn last_refresh_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().refreshed_at
    }

    fn watermark_is_fresh(&self, now: Instant) -> bool {
        self.state
            .read()
            .watermark
            .is_some_and(|at| now.saturating_duration_since(at) < self.ttl)
    }

    fn refresh_due(&self, now: Instant) -> bool {
        self.state
            .read()
            .last_attempt
            .map_or(true, |at| now.saturating_duration_since(at) >= self.retry_backoff)
    }

    async fn refresh(&self, force: bool) -> Result<usize> {
        let _guard = if force {
            self.refresh_lock.lock().await
        } else {
            match self.refresh_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    trace!("Entitlement refresh already in flight, using current state");
                    return Ok(0);
                }
            }
        };

        let started = Instant::now();
        self.state.write().last_attempt = Some(started);

        let loaded = tokio::time::timeout(self.refresh_timeout, self.source.bulk_load_entitlements())
            .await
            .map_err(|_| {
                GatewayError::UpstreamUnavailable(format!(
                    "bulk entitlement load timed out after {:?}",
                    self.refresh_timeout
                ))
            })
            .and_then(|result| result);

        let entitlements = match loaded {
            Ok(entitlements) => entitlements,
            Err(e) => {
                warn!(
                    error = %e,
                    cached_tokens = self.entries.len(),
                    "Bulk entitlement load failed, serving last-known entitlements"
                );
                return Err(e);
            }
        };

        let expires_at = started + self.ttl;
        let mut loaded_tokens = HashSet::with_capacity(entitlements.len());
        for entitlement in entitlements {
            loaded_tokens.insert(entitlement.token.clone());
            self.entries.insert(
                entitlement.token,
                CacheEntry {
                    access_level: entitlement.access_level,
                    credit_balance: entitlement.credit_balance,
                    expires_at,
                },
            );
        }
        // Overwrite first, then evict, so lookups never observe an empty cache
        self.entries.retain(|token, _| loaded_tokens.contains(token));

        {
            let mut state = self.state.write();
            state.watermark = Some(started);
            state.refreshed_at = Some(Utc::now());
        }

        info!(
            tokens = loaded_tokens.len(),
            forced = force,
            "Entitlement cache refreshed"
        );
        Ok(loaded_tokens.len())
    }
}
