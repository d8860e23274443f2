//! Single-slot response cache. One body per endpoint, no TTL; the slot is
//! cleared only when the endpoint is re-registered or deleted.

use super::registry::EndpointSlot;

impl EndpointSlot {
    /// The stored body, if caching is on and a fetch has populated it.
    pub fn cached_body(&self) -> Option<String> {
        self.with_state(|state| {
            let e = &state.endpoint;
            (e.cache_enabled && !e.cached_body.is_empty()).then(|| e.cached_body.clone())
        })
    }

    /// Store `body` when caching is enabled. Returns whether the slot changed.
    pub(crate) fn fill_cache(&self, body: &str) -> bool {
        self.with_state(|state| {
            let e = &mut state.endpoint;
            if !e.cache_enabled || e.cached_body == body {
                return false;
            }
            e.cached_body = body.to_string();
            true
        })
    }
}
