//! Still-image acquisition from heterogeneous classroom IP cameras.
//!
//! A capture request flows through [`scheduler::CaptureScheduler`] (bounded
//! concurrency), [`fleet::CameraFleet`] (config cache, circuit breaker,
//! pooled client) and [`strategy::CaptureChain`] (protocol fallback), and
//! ends as a [`strategy::CaptureResult`]. [`discovery::DiscoveryScanner`]
//! finds cameras on a local segment independently.

pub mod config;
pub mod config_store;
pub mod discovery;
pub mod error;
pub mod fleet;
pub mod health;
pub mod image;
pub mod pool;
pub mod registry;
pub mod scheduler;
pub mod sink;
pub mod strategy;
pub mod transport;
pub mod util;

#[cfg(test)]
mod testing;

pub use error::{CamError, FailureKind, Result};
pub use strategy::CaptureResult;
