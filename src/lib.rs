//! Creditgate - Credit-Metered API Gateway
//!
//! This crate gates a metered HTTP API behind opaque API tokens. Requests are
//! admitted under tiered fixed-window rate limits, charged per route against a
//! locally cached credit balance, and the resulting usage is batched back to
//! an external billing system that remains the source of truth.

pub mod config;
pub mod entitlement;
pub mod error;
pub mod http;
pub mod ledger;
pub mod ratelimit;
pub mod sync;
