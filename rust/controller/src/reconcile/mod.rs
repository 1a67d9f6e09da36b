//! Configuration-sync engine: watches load-balancer configuration
//! objects and cluster nodes, and drives the backend adapter to keep
//! pools, listeners, virtual servers and monitors in sync.
pub mod backend;
pub mod engine;
pub mod lbconfig;
pub mod nodes;
pub mod queue;
pub mod service_lookup;
pub mod state;

pub use engine::{ReconcileEngine, SyncError};
pub use lbconfig::ConfigKey;
pub use queue::DedupQueue;
