pub mod client;
pub mod group;
pub mod manager;

pub use client::{AutoscalingClient, ClientError, ComputeClient, HttpFleetClient};
pub use group::{LaunchTemplate, NodeGroup};
pub use manager::{CloudManager, Error as ManagerError};
