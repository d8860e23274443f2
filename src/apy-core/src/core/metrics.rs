//! Read-only aggregation of lifetime totals over the registry.

use super::registry::Registry;
use crate::models::{Metric, MetricsSnapshot};

impl Registry {
    /// Per-endpoint totals keyed by display name. Names are not unique, so a
    /// repeated name is suffixed with its route identity.
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut endpoints = self.endpoints();
        endpoints.sort_by(|a, b| a.route_id().cmp(&b.route_id()));

        let mut snapshot = MetricsSnapshot::new();
        for e in endpoints {
            let key = if snapshot.contains_key(&e.name) {
                format!("{} ({})", e.name, e.route_id())
            } else {
                e.name.clone()
            };
            snapshot.insert(
                key,
                Metric {
                    path: e.path,
                    method: e.method,
                    url: e.url,
                    requests: e.total_requests,
                },
            );
        }
        snapshot
    }
}
