pub mod endpoint;
pub mod metrics;

pub use endpoint::*;
pub use metrics::*;
