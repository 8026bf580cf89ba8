//! Interface layer - External interfaces
//!
//! This layer handles:
//! - The WebSocket signaling relay
//! - Health and Prometheus metrics endpoints

pub mod api;
