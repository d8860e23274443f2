//! Apy core: the endpoint registry and the request pipeline that every
//! proxied call goes through.

pub mod core;
pub mod error;
pub mod models;

pub use crate::core::{
    Clock, EndpointSlot, ForwardRequest, HttpForwarder, ManualClock, Permit, Pipeline,
    ProxyRequest, ProxyResponse, RateLimiter, Registry, SystemClock, Upstream, UpstreamResponse,
};
pub use error::{ApyError, ApyResult};
pub use models::{
    Endpoint, EndpointForm, FORM_METHODS, FormErrors, Metric, MetricsSnapshot, RESERVED_PATHS,
    RouteId, is_reserved_path, normalize_path,
};
