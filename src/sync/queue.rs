//! Double-buffered usage queue.
//!
//! Writers always append to the live buffer. When a flush starts, the live
//! buffer is moved out as the in-flight snapshot and an empty buffer takes
//! its place, so usage recorded while a send is in progress lands in the
//! next batch instead of being merged into, or lost with, the one on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::mem;
use uuid::Uuid;

/// Usage accumulated for one token since its last flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingUsage {
    pub new_requests: u64,
    pub credits_consumed: u64,
}

impl PendingUsage {
    fn add(&mut self, new_requests: u64, credits_consumed: u64) {
        self.new_requests = self.new_requests.saturating_add(new_requests);
        self.credits_consumed = self.credits_consumed.saturating_add(credits_consumed);
    }
}

/// One token's delta on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub token: String,
    pub new_requests: u64,
    pub credits_consumed: u64,
}

/// A flushed snapshot, as sent to the billing backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageBatch {
    /// Unique per snapshot so the backend can apply it idempotently
    pub batch_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub records: Vec<UsageRecord>,
}

impl UsageBatch {
    pub fn from_buffer(buffer: &HashMap<String, PendingUsage>) -> Self {
        let mut records: Vec<UsageRecord> = buffer
            .iter()
            .map(|(token, usage)| UsageRecord {
                token: token.clone(),
                new_requests: usage.new_requests,
                credits_consumed: usage.credits_consumed,
            })
            .collect();
        records.sort_by(|a, b| a.token.cmp(&b.token));

        Self {
            batch_id: Uuid::new_v4(),
            created_at: Utc::now(),
            records,
        }
    }

    pub fn total_credits(&self) -> u64 {
        self.records.iter().map(|r| r.credits_consumed).sum()
    }

    pub fn total_requests(&self) -> u64 {
        self.records.iter().map(|r| r.new_requests).sum()
    }
}

/// Scheduler state of the sync manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Nothing pending, no timer running
    Idle,
    /// Usage pending, flush timer running
    Armed,
    /// A snapshot is being sent
    Flushing,
}

/// Why a flush did not send anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushSkip {
    /// No usage pending
    Empty,
    /// Another flush is in flight
    InFlight,
    /// A timer fired after being superseded
    StaleTimer,
}

/// The live buffer, the scheduler state and the timer generation.
#[derive(Debug)]
pub struct SyncQueue {
    live: HashMap<String, PendingUsage>,
    in_flight_tokens: usize,
    state: SyncState,
    /// Generation of the currently armed timer; older timers are ignored
    epoch: u64,
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncQueue {
    pub fn new() -> Self {
        Self {
            live: HashMap::new(),
            in_flight_tokens: 0,
            state: SyncState::Idle,
            epoch: 0,
        }
    }

    /// Add usage to the live buffer.
    ///
    /// Returns the epoch of a timer the caller must arm when this write
    /// moved the queue out of `Idle`.
    pub fn record(&mut self, token: &str, new_requests: u64, credits_consumed: u64) -> Option<u64> {
        match self.live.get_mut(token) {
            Some(usage) => usage.add(new_requests, credits_consumed),
            None => {
                let mut usage = PendingUsage::default();
                usage.add(new_requests, credits_consumed);
                self.live.insert(token.to_string(), usage);
            }
        }

        if self.state == SyncState::Idle {
            Some(self.arm())
        } else {
            None
        }
    }

    /// Whether a timer of the given generation is still the armed one.
    pub fn timer_is_current(&self, epoch: u64) -> bool {
        self.state == SyncState::Armed && self.epoch == epoch
    }

    /// Freeze the live buffer as a snapshot and swap in an empty one.
    pub fn begin_flush(&mut self) -> Result<HashMap<String, PendingUsage>, FlushSkip> {
        if self.state == SyncState::Flushing {
            return Err(FlushSkip::InFlight);
        }
        if self.live.is_empty() {
            self.state = SyncState::Idle;
            return Err(FlushSkip::Empty);
        }

        let snapshot = mem::take(&mut self.live);
        self.in_flight_tokens = snapshot.len();
        self.state = SyncState::Flushing;
        Ok(snapshot)
    }

    /// Close out an in-flight flush.
    ///
    /// `requeue` is merged back into the live buffer when a failed batch
    /// should be retried. Returns the epoch of a timer to arm when usage is
    /// still pending.
    pub fn finish_flush(&mut self, requeue: Option<HashMap<String, PendingUsage>>) -> Option<u64> {
        if let Some(requeue) = requeue {
            for (token, usage) in requeue {
                self.live
                    .entry(token)
                    .or_default()
                    .add(usage.new_requests, usage.credits_consumed);
            }
        }

        self.in_flight_tokens = 0;
        if self.live.is_empty() {
            self.state = SyncState::Idle;
            None
        } else {
            Some(self.arm())
        }
    }

    fn arm(&mut self) -> u64 {
        self.state = SyncState::Armed;
        self.epoch = self.epoch.wrapping_add(1);
        self.epoch
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Tokens with usage waiting for the next flush.
    pub fn pending_tokens(&self) -> usize {
        self.live.len()
    }

    /// Tokens in the snapshot currently being sent.
    pub fn in_flight_tokens(&self) -> usize {
        self.in_flight_tokens
    }

    /// Usage waiting for the next flush for one token.
    pub fn pending(&self, token: &str) -> Option<PendingUsage> {
        self.live.get(token).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_record_arms() {
        let mut queue = SyncQueue::new();
        assert_eq!(queue.record("tok_a", 1, 2), Some(1));
        assert_eq!(queue.state(), SyncState::Armed);

        // Later writes only accumulate
        assert_eq!(queue.record("tok_a", 1, 3), None);
        assert_eq!(
            queue.pending("tok_a"),
            Some(PendingUsage {
                new_requests: 2,
                credits_consumed: 5
            })
        );
    }

    #[test]
    fn test_writes_during_flush_go_to_next_batch() {
        let mut queue = SyncQueue::new();
        queue.record("tok_a", 1, 1);

        let snapshot = queue.begin_flush().unwrap();
        assert_eq!(queue.state(), SyncState::Flushing);
        assert_eq!(queue.in_flight_tokens(), 1);

        assert_eq!(queue.record("tok_a", 1, 4), None);
        assert_eq!(snapshot["tok_a"].credits_consumed, 1);
        assert_eq!(queue.pending("tok_a").unwrap().credits_consumed, 4);

        // Completion re-arms for the deferred write
        let epoch = queue.finish_flush(None).unwrap();
        assert!(queue.timer_is_current(epoch));
        assert_eq!(queue.pending("tok_a").unwrap().credits_consumed, 4);
    }

    #[test]
    fn test_flush_is_single_flight() {
        let mut queue = SyncQueue::new();
        queue.record("tok_a", 1, 1);
        queue.begin_flush().unwrap();
        queue.record("tok_b", 1, 1);

        assert_eq!(queue.begin_flush().unwrap_err(), FlushSkip::InFlight);
    }

    #[test]
    fn test_empty_flush_returns_to_idle() {
        let mut queue = SyncQueue::new();
        assert_eq!(queue.begin_flush().unwrap_err(), FlushSkip::Empty);
        assert_eq!(queue.state(), SyncState::Idle);

        queue.record("tok_a", 1, 1);
        queue.begin_flush().unwrap();
        assert_eq!(queue.finish_flush(None), None);
        assert_eq!(queue.state(), SyncState::Idle);
    }

    #[test]
    fn test_superseded_timer_is_stale() {
        let mut queue = SyncQueue::new();
        let first = queue.record("tok_a", 1, 1).unwrap();

        // A manual flush consumes the armed state before the timer fires
        queue.begin_flush().unwrap();
        queue.record("tok_a", 1, 1);
        let second = queue.finish_flush(None).unwrap();

        assert!(!queue.timer_is_current(first));
        assert!(queue.timer_is_current(second));
    }

    #[test]
    fn test_requeue_merges_failed_snapshot() {
        let mut queue = SyncQueue::new();
        queue.record("tok_a", 2, 6);
        let snapshot = queue.begin_flush().unwrap();
        queue.record("tok_a", 1, 1);

        queue.finish_flush(Some(snapshot));
        assert_eq!(
            queue.pending("tok_a"),
            Some(PendingUsage {
                new_requests: 3,
                credits_consumed: 7
            })
        );
    }

    #[test]
    fn test_batch_from_buffer() {
        let mut buffer = HashMap::new();
        buffer.insert(
            "tok_b".to_string(),
            PendingUsage {
                new_requests: 2,
                credits_consumed: 10,
            },
        );
        buffer.insert(
            "tok_a".to_string(),
            PendingUsage {
                new_requests: 1,
                credits_consumed: 3,
            },
        );

        let batch = UsageBatch::from_buffer(&buffer);
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[0].token, "tok_a");
        assert_eq!(batch.total_credits(), 13);
        assert_eq!(batch.total_requests(), 3);

        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["records"][1]["credits_consumed"], 10);
        assert!(json["batch_id"].is_string());
    }
}
