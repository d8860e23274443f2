//! Fixed-window rate limiting per endpoint.
//!
//! The window rolls lazily on the next request; there is no timer. A request
//! that passes the check holds a [`Permit`] until the pipeline finishes:
//! committing it counts the request, dropping it gives the reservation back.

use super::clock::Clock;
use super::registry::EndpointSlot;
use crate::error::{ApyError, ApyResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct RateLimiter {
    window_secs: i64,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            window_secs: i64::try_from(window.as_secs()).unwrap_or(i64::MAX),
            clock,
        }
    }

    /// Admit one request or fail with [`ApyError::RateLimited`].
    ///
    /// Requests still in flight occupy a place in the window, so concurrent
    /// callers can never overshoot the limit.
    pub fn acquire(&self, slot: &Arc<EndpointSlot>) -> ApyResult<Permit> {
        let now = self.clock.now();
        slot.with_state(|state| {
            let endpoint = &mut state.endpoint;
            if endpoint.is_limited() {
                if now - endpoint.window_start >= self.window_secs {
                    endpoint.request_count = 0;
                    endpoint.window_start = now;
                }
                let used = endpoint.request_count + state.in_flight;
                if used >= endpoint.rate_limit.unsigned_abs() {
                    debug!(route = %slot.id(), used, limit = endpoint.rate_limit, "rate limit reached");
                    return Err(ApyError::RateLimited {
                        route: slot.id().to_string(),
                    });
                }
            }
            state.in_flight += 1;
            Ok(())
        })?;

        Ok(Permit {
            slot: slot.clone(),
            settled: false,
        })
    }
}

/// A reserved place in an endpoint's current window.
#[must_use = "dropping a permit releases the reservation without counting the request"]
pub struct Permit {
    slot: Arc<EndpointSlot>,
    settled: bool,
}

impl Permit {
    /// Count the request: window counter and lifetime total both advance.
    pub fn commit(mut self) {
        self.slot.with_state(|state| {
            state.in_flight = state.in_flight.saturating_sub(1);
            state.endpoint.request_count += 1;
            state.endpoint.total_requests += 1;
        });
        self.settled = true;
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.settled {
            self.slot.with_state(|state| {
                state.in_flight = state.in_flight.saturating_sub(1);
            });
        }
    }
}
