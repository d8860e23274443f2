use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifetime traffic for one endpoint, as reported by `GET /metrics`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    pub path: String,
    pub method: String,
    /// Upstream target the endpoint forwards to.
    pub url: String,
    pub requests: u64,
}

/// Metrics keyed by endpoint display name.
pub type MetricsSnapshot = BTreeMap<String, Metric>;
