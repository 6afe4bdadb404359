//! Token entitlements and their source of truth.

mod cache;
mod source;

pub use cache::{Deduction, Entitlement, EntitlementCache};
pub use source::{AccessLevel, HttpSourceOfTruth, SourceOfTruth, TokenEntitlement};

#[cfg(test)]
pub(crate) use source::testing;
