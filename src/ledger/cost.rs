//! Per-route credit costs.

use crate::config::CostConfig;

/// Maps request paths to credit costs by longest matching prefix.
///
/// Prefixes match on path segment boundaries, so `/v1/blocks` covers
/// `/v1/blocks` and `/v1/blocks/42` but not `/v1/blocksets`.
#[derive(Debug, Clone)]
pub struct RouteCostTable {
    /// Sorted longest prefix first
    routes: Vec<(String, u64)>,
    default_cost: u64,
}

impl RouteCostTable {
    pub fn new(config: &CostConfig) -> Self {
        let mut routes: Vec<(String, u64)> = config
            .routes
            .iter()
            .map(|(prefix, cost)| (prefix.trim_end_matches('/').to_string(), *cost))
            .collect();
        routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        Self {
            routes,
            default_cost: config.default_cost,
        }
    }

    /// Credit cost of a request to `path`.
    pub fn cost_for(&self, path: &str) -> u64 {
        self.routes
            .iter()
            .find(|(prefix, _)| Self::matches(prefix, path))
            .map(|(_, cost)| *cost)
            .unwrap_or(self.default_cost)
    }

    fn matches(prefix: &str, path: &str) -> bool {
        if prefix.is_empty() {
            return true;
        }
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

impl Default for RouteCostTable {
    fn default() -> Self {
        Self::new(&CostConfig::default())
    }
}
