use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::controller::InstanceIdentity;
use crate::error::{DomainError, Result};
use crate::scale_set::{LifecycleState, ScaleSet};
use crate::worker::{InstanceId, Worker};
use crate::worker_pool::WorkerPool;

/// The state of the world as far as the autoscaler is concerned: the worker
/// pool joined with the scale set, validated, with the indices the queries
/// need. Immutable for the rest of the tick except for the in-memory
/// capacity correction applied by the sanity check.
pub struct State {
    pool: WorkerPool,
    scale_set: ScaleSet,
    scale_down_delay: Duration,
    taken_at: DateTime<Utc>,

    in_service_instance_ids: HashSet<InstanceId>,
    workers_by_instance_id: HashMap<InstanceId, Worker>,
    drained_by_instance_id: HashMap<InstanceId, Worker>,
}

impl State {
    /// Joins and validates the two snapshots. Fails fast: a scale set
    /// without a name, a worker with unusable metadata or a worker claiming
    /// a different scale set all abort the tick, because scale math against
    /// such a snapshot would not be reliable.
    pub fn new(
        pool: WorkerPool,
        scale_set: ScaleSet,
        scale_down_delay_minutes: i64,
        identity: &dyn InstanceIdentity,
    ) -> Result<Self> {
        if scale_set.name.is_empty() {
            return Err(DomainError::ScaleSetValidation {
                reason: "scale set name is not set".to_string(),
            });
        }

        if !(scale_set.min_size <= scale_set.desired_capacity
            && scale_set.desired_capacity <= scale_set.max_size)
        {
            warn!(
                min_size = scale_set.min_size,
                max_size = scale_set.max_size,
                desired_capacity = scale_set.desired_capacity,
                "scale set size invariant violated on read"
            );
        }

        let mut workers_by_instance_id = HashMap::new();
        for worker in &pool.workers {
            let instance_id = validated_identity(worker, &scale_set.name, identity)?;
            workers_by_instance_id.insert(instance_id, worker.clone());
        }

        let mut drained_by_instance_id = HashMap::new();
        for worker in &pool.drained_workers {
            let instance_id = validated_identity(worker, &scale_set.name, identity)?;
            drained_by_instance_id.insert(instance_id, worker.clone());
        }

        let in_service_instance_ids = scale_set
            .instances
            .iter()
            .filter(|instance| instance.lifecycle_state == LifecycleState::InService)
            .map(|instance| instance.id.clone())
            .collect();

        Ok(Self {
            pool,
            scale_set,
            scale_down_delay: Duration::minutes(scale_down_delay_minutes),
            taken_at: Utc::now(),
            in_service_instance_ids,
            workers_by_instance_id,
            drained_by_instance_id,
        })
    }

    pub fn scale_set(&self) -> &ScaleSet {
        &self.scale_set
    }

    pub fn pending_runs(&self) -> i32 {
        self.pool.pending_runs
    }

    /// Live (non-drained) workers that passed validation.
    pub fn worker_count(&self) -> usize {
        self.pool.workers.len()
    }

    pub fn instance_count(&self) -> usize {
        self.scale_set.instances.len()
    }

    /// Idle workers eligible for scale-in, oldest first.
    ///
    /// A non-zero scale-down delay gives freshly provisioned workers a grace
    /// window to pick up work before they become termination candidates.
    pub fn scalable_workers(&self) -> Vec<Worker> {
        self.pool
            .workers
            .iter()
            .filter(|worker| !worker.busy)
            .filter(|worker| {
                self.scale_down_delay.is_zero()
                    || self.taken_at > worker.created() + self.scale_down_delay
            })
            .cloned()
            .collect()
    }

    /// Instance IDs with no live worker behind them: in-service instances
    /// missing from the pool, plus instances of drained workers that already
    /// left the scale set (a scale-down that detached but never terminated).
    /// Order is unspecified.
    pub fn stray_instances(&self) -> Vec<InstanceId> {
        let mut strays: Vec<InstanceId> = self
            .in_service_instance_ids
            .iter()
            .filter(|id| !self.workers_by_instance_id.contains_key(id))
            .cloned()
            .collect();

        strays.extend(self.detached_not_terminated_instances());
        strays
    }

    fn detached_not_terminated_instances(&self) -> Vec<InstanceId> {
        let member_ids: HashSet<&InstanceId> =
            self.scale_set.instances.iter().map(|instance| &instance.id).collect();

        self.drained_by_instance_id
            .keys()
            .filter(|id| !member_ids.contains(id))
            .cloned()
            .collect()
    }

    /// Applies the sanity-check capacity reset to the in-memory view so the
    /// rest of the tick runs against corrected data.
    pub fn apply_corrected_capacity(&mut self, desired_capacity: i32) {
        self.scale_set.desired_capacity = desired_capacity;
    }
}

fn validated_identity(
    worker: &Worker,
    scale_set_name: &str,
    identity: &dyn InstanceIdentity,
) -> Result<InstanceId> {
    let (group_id, instance_id) = identity.instance_identity(worker)?;

    if group_id.as_str().is_empty() {
        return Err(DomainError::WorkerMetadata {
            worker_id: worker.id.clone(),
            reason: "empty scale set ID in metadata".to_string(),
        });
    }

    if instance_id.as_str().is_empty() {
        return Err(DomainError::WorkerMetadata {
            worker_id: worker.id.clone(),
            reason: "empty instance ID in metadata".to_string(),
        });
    }

    if group_id.as_str() != scale_set_name {
        return Err(DomainError::WorkerGroupMismatch {
            worker_id: worker.id.clone(),
            actual: group_id.0,
            expected: scale_set_name.to_string(),
        });
    }

    Ok(instance_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{identity, instance, scale_set, worker, worker_pool};

    #[test]
    fn rejects_scale_set_without_a_name() {
        let err = State::new(
            worker_pool(0, vec![]),
            scale_set("", 1, 3, 2, vec![]),
            0,
            &identity(),
        )
        .unwrap_err();

        assert!(matches!(err, DomainError::ScaleSetValidation { .. }));
    }

    #[test]
    fn rejects_worker_from_another_scale_set() {
        let pool = worker_pool(0, vec![worker("w1", "other-group", "i-1", 10, false)]);
        let err = State::new(pool, scale_set("group", 1, 3, 2, vec![]), 0, &identity()).unwrap_err();

        assert!(matches!(
            err,
            DomainError::WorkerGroupMismatch { actual, expected, .. }
                if actual == "other-group" && expected == "group"
        ));
    }

    #[test]
    fn rejects_worker_with_empty_group_id() {
        let pool = worker_pool(0, vec![worker("w1", "", "i-1", 10, false)]);
        let err = State::new(pool, scale_set("group", 1, 3, 2, vec![]), 0, &identity()).unwrap_err();

        assert!(matches!(err, DomainError::WorkerMetadata { .. }));
    }

    #[test]
    fn rejects_worker_with_malformed_metadata() {
        let mut bad = worker("w1", "group", "i-1", 10, false);
        bad.metadata = "not json".to_string();
        let pool = worker_pool(0, vec![bad]);

        let err = State::new(pool, scale_set("group", 1, 3, 2, vec![]), 0, &identity()).unwrap_err();
        assert!(matches!(err, DomainError::WorkerMetadata { .. }));
    }

    #[test]
    fn in_service_instance_without_worker_is_stray() {
        let state = State::new(
            worker_pool(0, vec![]),
            scale_set(
                "group",
                1,
                3,
                1,
                vec![instance("i-1", LifecycleState::InService)],
            ),
            0,
            &identity(),
        )
        .unwrap();

        assert_eq!(state.stray_instances(), vec![InstanceId("i-1".to_string())]);
    }

    #[test]
    fn pending_instance_without_worker_is_not_stray() {
        let state = State::new(
            worker_pool(0, vec![]),
            scale_set(
                "group",
                1,
                3,
                1,
                vec![instance("i-1", LifecycleState::Pending)],
            ),
            0,
            &identity(),
        )
        .unwrap();

        assert!(state.stray_instances().is_empty());
    }

    #[test]
    fn drained_worker_with_vanished_instance_is_stray() {
        let mut drained = worker("w2", "group", "i-gone", 20, false);
        drained.drained = true;

        let pool = worker_pool(
            0,
            vec![worker("w1", "group", "i-1", 10, false), drained],
        );
        let state = State::new(
            pool,
            scale_set(
                "group",
                1,
                5,
                3,
                vec![instance("i-1", LifecycleState::InService)],
            ),
            0,
            &identity(),
        )
        .unwrap();

        assert_eq!(
            state.stray_instances(),
            vec![InstanceId("i-gone".to_string())]
        );
    }

    #[test]
    fn drained_worker_with_instance_still_present_is_not_double_counted() {
        // The instance shows up through the missing-live-worker rule alone.
        let mut drained = worker("w1", "group", "i-1", 10, false);
        drained.drained = true;

        let state = State::new(
            worker_pool(0, vec![drained]),
            scale_set(
                "group",
                0,
                3,
                1,
                vec![instance("i-1", LifecycleState::InService)],
            ),
            0,
            &identity(),
        )
        .unwrap();

        assert_eq!(state.stray_instances(), vec![InstanceId("i-1".to_string())]);
    }

    #[test]
    fn scalable_workers_excludes_busy_and_keeps_oldest_first() {
        let pool = worker_pool(
            0,
            vec![
                worker("young", "group", "i-3", 300, false),
                worker("busy", "group", "i-2", 200, true),
                worker("old", "group", "i-1", 100, false),
            ],
        );
        let state = State::new(pool, scale_set("group", 1, 5, 3, vec![]), 0, &identity()).unwrap();

        let ids: Vec<String> = state.scalable_workers().into_iter().map(|w| w.id).collect();
        assert_eq!(ids, ["old", "young"]);
    }

    #[test]
    fn scale_down_delay_shields_young_workers() {
        let now = Utc::now().timestamp();
        let pool = worker_pool(
            0,
            vec![
                worker("seasoned", "group", "i-1", now - 3600, false),
                worker("fresh", "group", "i-2", now - 60, false),
            ],
        );
        let state = State::new(pool, scale_set("group", 1, 5, 2, vec![]), 30, &identity()).unwrap();

        let ids: Vec<String> = state.scalable_workers().into_iter().map(|w| w.id).collect();
        assert_eq!(ids, ["seasoned"]);
    }

    #[test]
    fn zero_delay_makes_every_idle_worker_scalable() {
        let now = Utc::now().timestamp();
        let pool = worker_pool(0, vec![worker("fresh", "group", "i-1", now, false)]);
        let state = State::new(pool, scale_set("group", 1, 5, 1, vec![]), 0, &identity()).unwrap();

        assert_eq!(state.scalable_workers().len(), 1);
    }

    #[test]
    fn corrected_capacity_is_visible_to_later_queries() {
        let mut state = State::new(
            worker_pool(0, vec![]),
            scale_set("group", 1, 100, 79, vec![]),
            0,
            &identity(),
        )
        .unwrap();

        state.apply_corrected_capacity(8);
        assert_eq!(state.scale_set().desired_capacity, 8);
    }
}
