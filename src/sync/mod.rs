//! Usage aggregation and batch sync to the billing backend.

mod manager;
mod queue;

pub use manager::{BatchSyncManager, FlushOutcome, SyncStats};
pub use queue::{FlushSkip, PendingUsage, SyncQueue, SyncState, UsageBatch, UsageRecord};
