//! Hand-rolled fixtures shared by the unit tests of this crate.

use crate::controller::InstanceIdentity;
use crate::error::Result;
use crate::scale_set::{Instance, LifecycleState, ScaleSet};
use crate::worker::{GroupId, InstanceId, Worker};
use crate::worker_pool::WorkerPool;

/// Identity resolver using the AWS metadata keys; the engine under test
/// only cares that SOME platform resolves the pair.
pub struct MetadataIdentity;

impl InstanceIdentity for MetadataIdentity {
    fn instance_identity(&self, worker: &Worker) -> Result<(GroupId, InstanceId)> {
        Ok((
            GroupId(worker.metadata_value("asg_id")?),
            InstanceId(worker.metadata_value("instance_id")?),
        ))
    }
}

pub fn identity() -> MetadataIdentity {
    MetadataIdentity
}

pub fn worker(id: &str, group: &str, instance: &str, created_at: i64, busy: bool) -> Worker {
    Worker {
        id: id.to_string(),
        busy,
        drained: false,
        created_at,
        metadata: serde_json::json!({ "asg_id": group, "instance_id": instance }).to_string(),
    }
}

pub fn instance(id: &str, lifecycle_state: LifecycleState) -> Instance {
    Instance {
        id: InstanceId(id.to_string()),
        launch_time: None,
        lifecycle_state,
    }
}

pub fn scale_set(
    name: &str,
    min_size: i32,
    max_size: i32,
    desired_capacity: i32,
    instances: Vec<Instance>,
) -> ScaleSet {
    ScaleSet {
        name: name.to_string(),
        min_size,
        max_size,
        desired_capacity,
        instances,
    }
}

/// Builds a pool and runs the adapter-side normalization, exactly as a
/// controller would before handing the pool to the loader.
pub fn worker_pool(pending_runs: i32, workers: Vec<Worker>) -> WorkerPool {
    let mut pool = WorkerPool {
        pending_runs,
        workers,
        drained_workers: Vec::new(),
    };
    pool.normalize();
    pool
}
