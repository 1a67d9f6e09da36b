//! The logical node group: a fungible set of machines sized by a cloud
//! autoscaling facility.
use crate::nodegroup_spec::NodeGroupSpec;

/// Launch-template attributes cached from the fleet API the first time a
/// group's members are listed. Absent until the first successful list.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchTemplate {
    pub instance_type: String,
    pub availability_zones: Vec<String>,
    pub spot_price_hint: Option<f64>,
}

/// A registered node group. `min_size`/`max_size`/`cost` come from the
/// static spec or from auto-discovery; `target_size` and
/// `launch_template` are filled in from the cloud API as they become
/// known.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeGroup {
    pub identifier: String,
    pub min_size: i64,
    pub max_size: i64,
    pub cost: Option<f64>,
    pub launch_template: Option<LaunchTemplate>,
}

impl NodeGroup {
    pub fn new(identifier: impl Into<String>, min_size: i64, max_size: i64) -> Self {
        Self {
            identifier: identifier.into(),
            min_size,
            max_size,
            cost: None,
            launch_template: None,
        }
    }

    pub fn from_spec(spec: &NodeGroupSpec) -> Self {
        Self {
            identifier: spec.identifier.clone(),
            min_size: spec.min_size,
            max_size: spec.max_size,
            cost: spec.cost,
            launch_template: None,
        }
    }

    /// `min_size ≤ target_size ≤ max_size`.
    pub fn size_in_bounds(&self, target_size: i64) -> bool {
        self.min_size <= target_size && target_size <= self.max_size
    }
}
