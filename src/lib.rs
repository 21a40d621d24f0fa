//! Sandbox platform core services.
//!
//! Two services share this crate: the runner fleet autoscaler, which keeps
//! the pool of sandbox-hosting runners sized to demand, and the preview
//! proxy authentication layer, which admits requests to sandbox previews.

pub mod api;
pub mod config;
pub mod proxy;
pub mod scaler;
