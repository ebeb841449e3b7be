use async_trait::async_trait;

use crate::error::Result;
use crate::scale_set::{Instance, ScaleSet};
use crate::worker::{GroupId, InstanceId, Worker};
use crate::worker_pool::WorkerPool;

/// Resolves the scale-set and instance identifiers a worker reported in its
/// metadata. Each platform uses its own metadata keys, and those keys stay
/// in the platform controllers; the engine only ever sees the resolved pair.
pub trait InstanceIdentity: Send + Sync {
    fn instance_identity(&self, worker: &Worker) -> Result<(GroupId, InstanceId)>;
}

/// The capability interface the reconciler drives. One implementation per
/// cloud platform, each wrapping the Spacelift API client plus that cloud's
/// management API.
#[async_trait]
pub trait Controller: InstanceIdentity {
    /// Returns the worker pool, normalized: drained workers set aside,
    /// live workers sorted oldest-first. Fails if the pool does not exist
    /// or is not accessible.
    async fn get_worker_pool(&self) -> Result<WorkerPool>;

    /// Returns the scale set. Fails if it is absent or ambiguous.
    async fn get_scale_set(&self) -> Result<ScaleSet>;

    /// Returns details for the given instances. Every returned instance
    /// carries an ID and a launch time.
    async fn describe_instances(&self, instance_ids: &[InstanceId]) -> Result<Vec<Instance>>;

    /// Marks a worker as ineligible for new runs. Returns `false` when the
    /// worker turned out to be busy, in which case the drain has already
    /// been undone; the caller must not terminate its instance.
    async fn drain_worker(&self, worker_id: &str) -> Result<bool>;

    /// Terminates an instance and removes it from the scale set.
    /// Implementations MUST ensure the set's desired capacity is
    /// decremented as part of this operation (explicitly on AWS, via
    /// platform auto-adjustment on Azure and GCP). The caller does not
    /// separately adjust capacity during scale-down.
    async fn kill_instance(&self, instance_id: &InstanceId) -> Result<()>;

    /// Sets the scale set's target size. Despite the name, the value may be
    /// lower than the current one; the capacity sanity reset relies on that.
    async fn scale_up(&self, desired_capacity: i32) -> Result<()>;
}
