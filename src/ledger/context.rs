//! Request-scoped admission state.

use crate::entitlement::AccessLevel;

/// State carried from admission through settlement for one request.
///
/// `deducted` guards the settlement side effect so that a response path
/// invoked more than once still charges the token exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Token the request is attributed to, if it resolved to an entitlement
    pub api_token: Option<String>,
    pub access_level: AccessLevel,
    /// Cached balance observed by the credit pre-check
    pub credits_at_admission: Option<u64>,
    pub deducted: bool,
}

impl RequestContext {
    pub fn new(api_token: Option<String>, access_level: AccessLevel) -> Self {
        Self {
            api_token,
            access_level,
            credits_at_admission: None,
            deducted: false,
        }
    }

    pub fn unauthenticated() -> Self {
        Self::new(None, AccessLevel::Unauthenticated)
    }

    pub fn is_metered(&self) -> bool {
        self.access_level == AccessLevel::Metered
    }
}
