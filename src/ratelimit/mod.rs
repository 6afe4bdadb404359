//! Tiered fixed-window rate limiting.

mod counter;
mod limiter;
mod policy;

pub use counter::{RateLimitWindow, TimeWindow};
pub use limiter::AdmissionController;
pub use policy::{BucketKey, PolicyTier, RateLimitPolicy};
