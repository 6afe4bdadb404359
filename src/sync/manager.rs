//! Debounced, single-flight usage sync.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::queue::{FlushSkip, PendingUsage, SyncQueue, SyncState, UsageBatch};
use crate::config::SyncConfig;
use crate::entitlement::{EntitlementCache, SourceOfTruth};
use crate::error::GatewayError;

/// What a call to [`BatchSyncManager::flush_now`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Skipped(FlushSkip),
    Sent { batch_id: Uuid, records: usize },
    Failed { batch_id: Uuid, records: usize, requeued: bool },
}

/// Point-in-time view of the sync queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub state: SyncState,
    pub pending_tokens: usize,
    pub in_flight_tokens: usize,
}

/// Aggregates per-token usage and ships it to the billing backend.
///
/// The first usage record after an idle period arms a timer; when it fires
/// the live buffer is frozen and sent while new usage accumulates in its
/// replacement. Every completed send, successful or not, is followed by a
/// forced entitlement refresh.
#[derive(Clone)]
pub struct BatchSyncManager {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Mutex<SyncQueue>,
    /// Signalled whenever an in-flight flush completes
    flushed: Notify,
    source: Arc<dyn SourceOfTruth>,
    cache: Arc<EntitlementCache>,
    flush_interval: Duration,
    send_timeout: Duration,
    requeue_failed: bool,
}

impl BatchSyncManager {
    pub fn new(
        source: Arc<dyn SourceOfTruth>,
        cache: Arc<EntitlementCache>,
        config: &SyncConfig,
        send_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(SyncQueue::new()),
                flushed: Notify::new(),
                source,
                cache,
                flush_interval: config.flush_interval(),
                send_timeout,
                requeue_failed: config.requeue_failed,
            }),
        }
    }

    /// Add usage for a token. Never blocks on I/O.
    ///
    /// Must be called from within a tokio runtime, since the first record
    /// after an idle period spawns the flush timer.
    pub fn record(&self, token: &str, new_requests: u64, credits_consumed: u64) {
        let arm = self
            .inner
            .queue
            .lock()
            .record(token, new_requests, credits_consumed);

        if let Some(epoch) = arm {
            self.arm_timer(epoch);
        }
    }

    /// Flush pending usage now.
    ///
    /// This is the one flush path shared by the debounce timer, the periodic
    /// schedule and shutdown. A call made while another flush is in flight
    /// does nothing; the in-flight flush re-arms for anything left behind.
    pub async fn flush_now(&self) -> FlushOutcome {
        let snapshot = self.inner.queue.lock().begin_flush();
        match snapshot {
            Ok(snapshot) => self.dispatch(snapshot).await,
            Err(skip) => {
                trace!(reason = ?skip, "Flush skipped");
                FlushOutcome::Skipped(skip)
            }
        }
    }

    /// Flush until nothing is pending, waiting out any in-flight send.
    pub async fn drain(&self) {
        loop {
            // Registered before the flush attempt so a completion in between is not missed
            let finished = self.inner.flushed.notified();
            match self.flush_now().await {
                FlushOutcome::Skipped(FlushSkip::Empty) => break,
                FlushOutcome::Skipped(_) => finished.await,
                FlushOutcome::Failed { requeued: true, .. } => {
                    warn!("Usage batch failed during drain, leaving it pending");
                    break;
                }
                _ => {}
            }
        }
    }

    /// Spawn a fixed-schedule task that also drives the flush path.
    pub fn spawn_periodic(&self, period: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                trace!("Periodic usage sync tick");
                manager.flush_now().await;
            }
        })
    }

    pub fn stats(&self) -> SyncStats {
        let queue = self.inner.queue.lock();
        SyncStats {
            state: queue.state(),
            pending_tokens: queue.pending_tokens(),
            in_flight_tokens: queue.in_flight_tokens(),
        }
    }

    fn arm_timer(&self, epoch: u64) {
        let manager = self.clone();
        let delay = self.inner.flush_interval;
        debug!(epoch, delay_secs = delay.as_secs(), "Arming usage flush timer");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.fire(epoch).await;
        });
    }

    async fn fire(&self, epoch: u64) {
        let snapshot = {
            let mut queue = self.inner.queue.lock();
            if queue.timer_is_current(epoch) {
                queue.begin_flush()
            } else {
                Err(FlushSkip::StaleTimer)
            }
        };
        match snapshot {
            Ok(snapshot) => {
                self.dispatch(snapshot).await;
            }
            Err(skip) => trace!(epoch, reason = ?skip, "Flush timer superseded"),
        }
    }

    async fn dispatch(&self, snapshot: HashMap<String, PendingUsage>) -> FlushOutcome {
        let batch = UsageBatch::from_buffer(&snapshot);
        let records = batch.records.len();

        let result = tokio::time::timeout(self.inner.send_timeout, self.inner.source.apply_usage(&batch))
            .await
            .map_err(|_| {
                GatewayError::UpstreamUnavailable(format!(
                    "usage batch timed out after {:?}",
                    self.inner.send_timeout
                ))
            })
            .and_then(|result| result);

        let (outcome, requeue) = match result {
            Ok(()) => {
                info!(
                    batch_id = %batch.batch_id,
                    records,
                    credits = batch.total_credits(),
                    "Usage batch applied"
                );
                (
                    FlushOutcome::Sent {
                        batch_id: batch.batch_id,
                        records,
                    },
                    None,
                )
            }
            Err(e) => {
                let requeued = self.inner.requeue_failed;
                warn!(
                    batch_id = %batch.batch_id,
                    records,
                    credits = batch.total_credits(),
                    requeued,
                    error = %e,
                    "Usage batch failed"
                );
                (
                    FlushOutcome::Failed {
                        batch_id: batch.batch_id,
                        records,
                        requeued,
                    },
                    requeued.then_some(snapshot),
                )
            }
        };

        // Absorb top-ups and corrections made while usage was accumulating
        if let Err(e) = self.inner.cache.force_refresh().await {
            debug!(error = %e, "Post-flush entitlement refresh failed");
        }

        let arm = self.inner.queue.lock().finish_flush(requeue);
        if let Some(epoch) = arm {
            self.arm_timer(epoch);
        }
        self.inner.flushed.notify_waiters();
        outcome
    }
}
