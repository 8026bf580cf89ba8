//! API interface implementations

pub mod metrics_handler;
pub mod relay;
pub mod router;

pub use metrics_handler::{describe_metrics, init_metrics};
pub use relay::{relay_router, RelayState};
pub use router::build_router;
