//! Local media capture adapters

pub mod guard;
pub mod loopback;

pub use guard::MediaGuard;
pub use loopback::LoopbackMedia;
