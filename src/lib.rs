//! Homelab dashboard engine: liveness probes for configured services and
//! resource metrics correlated from a fleet-telemetry backend.

pub mod api;
pub mod config;
pub mod error;
pub mod extract;
pub mod health;
pub mod metrics;
pub mod models;
pub mod monitor;
pub mod normalize;
pub mod resolver;
pub mod store;
pub mod telemetry;
pub mod vault;
