pub mod cache;
pub mod clock;
pub mod forwarder;
pub mod limiter;
pub mod metrics;
pub mod pipeline;
pub mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use forwarder::{ForwardRequest, HttpForwarder, Upstream, UpstreamResponse};
pub use limiter::{Permit, RateLimiter};
pub use pipeline::{Pipeline, ProxyRequest, ProxyResponse};
pub use registry::{EndpointSlot, Registry};
