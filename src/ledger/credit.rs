//! Per-request credit accounting.
//!
//! Every metered request passes through two checkpoints. Before the handler
//! runs, [`CreditLedger::check_credits`] turns away tokens whose cached
//! balance is exhausted. After the handler produced a response,
//! [`CreditLedger::settle`] charges the route's cost against the cached
//! balance and hands the usage to the sync manager. Settlement is the only
//! place a cached balance goes down.

use std::sync::Arc;
use tracing::{debug, trace};

use super::context::RequestContext;
use super::cost::RouteCostTable;
use crate::entitlement::{Deduction, EntitlementCache};
use crate::error::{GatewayError, Result};
use crate::sync::BatchSyncManager;

/// What settlement did to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Admin or unauthenticated request; nothing is charged
    Unmetered,
    /// The request was already charged
    AlreadySettled,
    /// The cost was deducted and recorded as usage
    Charged { cost: u64, remaining: u64 },
}

/// Optimistic local ledger over the entitlement cache.
pub struct CreditLedger {
    cache: Arc<EntitlementCache>,
    costs: RouteCostTable,
    usage: BatchSyncManager,
}

impl CreditLedger {
    pub fn new(cache: Arc<EntitlementCache>, costs: RouteCostTable, usage: BatchSyncManager) -> Self {
        Self { cache, costs, usage }
    }

    /// Reject a metered request whose cached balance is already spent.
    pub fn check_credits(&self, ctx: &mut RequestContext) -> Result<()> {
        if !ctx.is_metered() {
            return Ok(());
        }
        let Some(token) = ctx.api_token.as_deref() else {
            return Ok(());
        };

        let balance = self.cache.balance(token).unwrap_or(0);
        ctx.credits_at_admission = Some(balance);
        if balance == 0 {
            debug!("Metered token has no credits left");
            return Err(GatewayError::InsufficientCredits);
        }
        Ok(())
    }

    /// Charge a request for `route` exactly once.
    ///
    /// On an overdraft the cached balance and pending usage are left as they
    /// were and the caller must replace the response with the error.
    pub fn settle(&self, ctx: &mut RequestContext, route: &str) -> Result<Settlement> {
        if ctx.deducted {
            return Ok(Settlement::AlreadySettled);
        }
        if !ctx.is_metered() {
            return Ok(Settlement::Unmetered);
        }
        let Some(token) = ctx.api_token.as_deref() else {
            return Ok(Settlement::Unmetered);
        };

        let cost = self.costs.cost_for(route);
        match self.cache.apply_deduction(token, cost) {
            Deduction::Applied { remaining } => {
                ctx.deducted = true;
                self.usage.record(token, 1, cost);
                trace!(route, cost, remaining, "Request settled");
                Ok(Settlement::Charged { cost, remaining })
            }
            Deduction::Overdraft { balance } => {
                debug!(
                    route,
                    cost,
                    balance,
                    admitted_with = ?ctx.credits_at_admission,
                    "Settlement would overdraw balance, rejecting response"
                );
                Err(GatewayError::InsufficientCredits)
            }
            Deduction::Missing => {
                debug!(route, cost, "Token evicted before settlement, rejecting response");
                Err(GatewayError::InsufficientCredits)
            }
        }
    }

    /// Cached balance for a token.
    pub fn balance(&self, token: &str) -> Option<u64> {
        self.cache.balance(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CostConfig, EntitlementConfig, SyncConfig};
    use crate::entitlement::testing::FakeSourceOfTruth;
    use crate::entitlement::AccessLevel;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    async fn ledger_with(
        tokens: &[(&str, AccessLevel, u64)],
        routes: &[(&str, u64)],
    ) -> (Arc<CreditLedger>, BatchSyncManager) {
        let fake = Arc::new(FakeSourceOfTruth::with_tokens(tokens));
        let cache = Arc::new(EntitlementCache::new(fake.clone(), &EntitlementConfig::default()));
        cache.force_refresh().await.unwrap();

        let usage = BatchSyncManager::new(
            fake,
            cache.clone(),
            &SyncConfig::default(),
            Duration::from_secs(5),
        );
        let costs = RouteCostTable::new(&CostConfig {
            default_cost: 1,
            routes: routes
                .iter()
                .map(|(p, c)| (p.to_string(), *c))
                .collect::<HashMap<_, _>>(),
        });
        (
            Arc::new(CreditLedger::new(cache, costs, usage.clone())),
            usage,
        )
    }

    fn metered(token: &str) -> RequestContext {
        RequestContext::new(Some(token.to_string()), AccessLevel::Metered)
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_credits_records_balance() {
        let (ledger, _) = ledger_with(&[("tok_metered", AccessLevel::Metered, 12)], &[]).await;

        let mut ctx = metered("tok_metered");
        assert_ok!(ledger.check_credits(&mut ctx));
        assert_eq!(ctx.credits_at_admission, Some(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_credits_rejects_empty_balance() {
        let (ledger, _) = ledger_with(&[("tok_broke", AccessLevel::Metered, 0)], &[]).await;

        let mut ctx = metered("tok_broke");
        let err = assert_err!(ledger.check_credits(&mut ctx));
        assert!(matches!(err, GatewayError::InsufficientCredits));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_twice_charges_once() {
        let (ledger, usage) =
            ledger_with(&[("tok_metered", AccessLevel::Metered, 10)], &[("/v1/blocks", 3)]).await;

        let mut ctx = metered("tok_metered");
        ledger.check_credits(&mut ctx).unwrap();

        let first = assert_ok!(ledger.settle(&mut ctx, "/v1/blocks/7"));
        assert_eq!(first, Settlement::Charged { cost: 3, remaining: 7 });
        assert!(ctx.deducted);

        let second = assert_ok!(ledger.settle(&mut ctx, "/v1/blocks/7"));
        assert_eq!(second, Settlement::AlreadySettled);
        assert_eq!(ledger.balance("tok_metered"), Some(7));
        assert_eq!(usage.stats().pending_tokens, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdraft_leaves_state_untouched() {
        let (ledger, usage) =
            ledger_with(&[("tok_metered", AccessLevel::Metered, 2)], &[("/v1/expensive", 5)]).await;

        let mut ctx = metered("tok_metered");
        ledger.check_credits(&mut ctx).unwrap();

        let err = assert_err!(ledger.settle(&mut ctx, "/v1/expensive"));
        assert!(matches!(err, GatewayError::InsufficientCredits));
        assert!(!ctx.deducted);
        assert_eq!(ledger.balance("tok_metered"), Some(2));
        assert_eq!(usage.stats().pending_tokens, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmetered_requests_are_free() {
        let (ledger, usage) =
            ledger_with(&[("tok_admin", AccessLevel::Unrestricted, 0)], &[("/v1", 100)]).await;

        let mut admin =
            RequestContext::new(Some("tok_admin".to_string()), AccessLevel::Unrestricted);
        assert_ok!(ledger.check_credits(&mut admin));
        assert_eq!(admin.credits_at_admission, None);
        for route in ["/v1/anything", "/other"] {
            assert_eq!(ledger.settle(&mut admin, route).unwrap(), Settlement::Unmetered);
        }

        let mut anonymous = RequestContext::unauthenticated();
        assert_ok!(ledger.check_credits(&mut anonymous));
        assert_eq!(ledger.settle(&mut anonymous, "/v1").unwrap(), Settlement::Unmetered);

        assert_eq!(ledger.balance("tok_admin"), Some(0));
        assert_eq!(usage.stats().pending_tokens, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_settlements_never_overdraw() {
        const REQUESTS: usize = 20;
        const BALANCE: u64 = 7;
        let (ledger, usage) =
            ledger_with(&[("tok_metered", AccessLevel::Metered, BALANCE)], &[]).await;

        // All requests pass the pre-check before any of them settles
        let mut contexts = Vec::with_capacity(REQUESTS);
        for _ in 0..REQUESTS {
            let mut ctx = metered("tok_metered");
            ledger.check_credits(&mut ctx).unwrap();
            contexts.push(ctx);
        }

        let handles = contexts.into_iter().map(|mut ctx| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.settle(&mut ctx, "/v1/blocks").is_ok() })
        });
        let successes = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|result| *result.as_ref().unwrap())
            .count() as u64;

        assert_eq!(successes, BALANCE);
        assert_eq!(ledger.balance("tok_metered"), Some(0));
        assert_eq!(usage.stats().pending_tokens, 1);
    }
}
