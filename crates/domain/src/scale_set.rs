use chrono::{DateTime, Utc};

use crate::worker::InstanceId;

/// Instance lifecycle, normalized across clouds. AWS reports lifecycle
/// states, Azure provisioning states and GCP current actions; the
/// controllers map them here. Only `InService` instances participate in the
/// worker/instance correspondence checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    InService,
    Pending,
    Terminating,
    Unknown,
}

/// A member of the scale set.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: InstanceId,
    /// Present on the describe path, absent on the group listing.
    pub launch_time: Option<DateTime<Utc>>,
    pub lifecycle_state: LifecycleState,
}

/// The cloud side of the snapshot: an AWS ASG, an Azure VMSS or a GCP IGM.
#[derive(Debug, Clone)]
pub struct ScaleSet {
    pub name: String,
    pub min_size: i32,
    pub max_size: i32,
    pub desired_capacity: i32,
    pub instances: Vec<Instance>,
}
