//! Runner fleet autoscaler.
//!
//! Reconciles three sources of truth each tick: the runner registry, the
//! Kubernetes node inventory, and the placeholder pods that drive the node
//! autoscaler. From the joined snapshot it derives aggregate capacity and
//! headroom, then either orders placeholder pods to force new nodes or
//! releases placeholders whose nodes can be drained safely.

pub mod decision;
pub mod driver;
pub mod metrics;
pub mod placeholder;
pub mod scaledown;
pub mod snapshot;

pub use driver::run;
