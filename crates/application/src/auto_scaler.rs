use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{error, info, warn};

use poolscale_domain::{
    Controller, DomainError, InstanceIdentity, Result, ScalingDirection, State,
};
use poolscale_shared::ScalingLimits;

/// How long a fresh instance gets to register itself with Spacelift before
/// an instance without a worker is considered stray.
const REGISTRATION_GRACE_MINUTES: i64 = 10;

/// Drives one reconciliation tick against a platform [`Controller`].
pub struct AutoScaler {
    controller: Arc<dyn Controller>,
    limits: ScalingLimits,
}

impl AutoScaler {
    pub fn new(controller: Arc<dyn Controller>, limits: ScalingLimits) -> Self {
        Self { controller, limits }
    }

    /// Runs one tick: load both snapshots, sanity-check the desired
    /// capacity, reap at most one stray instance, then execute the scale
    /// decision. Mutation failures are counted and reported at the end
    /// rather than rolled back; the next tick observes whatever state this
    /// one left behind and converges.
    pub async fn scale(&self) -> Result<()> {
        // The worker pool is read before the scale set. The two views are
        // independent and racy; the decision engine's balance check covers
        // the window between them.
        let pool = self.controller.get_worker_pool().await?;
        let scale_set = self.controller.get_scale_set().await?;

        info!(
            workers = pool.workers.len(),
            drained_workers = pool.drained_workers.len(),
            pending_runs = pool.pending_runs,
            instances = scale_set.instances.len(),
            desired_capacity = scale_set.desired_capacity,
            "loaded worker pool and scale set snapshots"
        );

        let identity: &dyn InstanceIdentity = self.controller.as_ref();
        let mut state = State::new(pool, scale_set, self.limits.scale_down_delay, identity)?;

        self.capacity_sanity_check(&mut state).await;

        let strays = state.stray_instances();
        if !strays.is_empty() {
            info!(strays = strays.len(), "instances without matching workers detected");

            let instances = self.controller.describe_instances(&strays).await?;
            let now = Utc::now();

            for instance in instances {
                let Some(launch_time) = instance.launch_time else {
                    return Err(DomainError::Cloud(format!(
                        "could not find launch time for instance {}",
                        instance.id
                    )));
                };

                let age = now.signed_duration_since(launch_time);

                // A recently launched instance may simply not have managed
                // to register with Spacelift yet.
                if age <= Duration::minutes(REGISTRATION_GRACE_MINUTES) {
                    info!(
                        instance_id = %instance.id,
                        age_seconds = age.num_seconds(),
                        "stray instance is still within its registration grace period, skipping"
                    );
                    continue;
                }

                warn!(
                    instance_id = %instance.id,
                    launch_timestamp = launch_time.timestamp(),
                    age_seconds = age.num_seconds(),
                    "instance has no corresponding worker, removing it from the scale set"
                );

                // One stray termination per tick. Even if the loop is
                // operating on stale data, it loses at most one instance
                // before the next tick re-observes the world.
                return match self.controller.kill_instance(&instance.id).await {
                    Ok(()) => {
                        info!(instance_id = %instance.id, "stray instance removed from the scale set and terminated");
                        Ok(())
                    }
                    Err(err) => {
                        error!(instance_id = %instance.id, error = %err, "could not kill stray instance");
                        Err(DomainError::TickFailed { errors: 1 })
                    }
                };
            }
        }

        let decision = state.decide(self.limits.max_create, self.limits.max_kill);

        info!(
            workers = state.worker_count(),
            instances = state.instance_count(),
            desired_capacity = state.scale_set().desired_capacity,
            pending_runs = state.pending_runs(),
            scaling_size = decision.scaling_size,
            comments = ?decision.comments,
            "made scaling decision"
        );

        let mut error_count = 0usize;

        match decision.direction {
            ScalingDirection::None => {
                info!("not scaling the scale set");
            }
            ScalingDirection::Up => {
                let target = state.scale_set().desired_capacity + decision.scaling_size;
                info!(instances = decision.scaling_size, target, "scaling up the scale set");

                if let Err(err) = self.controller.scale_up(target).await {
                    error!(error = %err, "could not scale up the scale set");
                    error_count += 1;
                }
            }
            ScalingDirection::Down => {
                info!(instances = decision.scaling_size, "scaling down the scale set");
                error_count += self.scale_down(&state, decision.scaling_size).await;
            }
        }

        if error_count > 0 {
            return Err(DomainError::TickFailed {
                errors: error_count,
            });
        }

        Ok(())
    }

    /// Drains and terminates up to `count` workers, oldest first.
    ///
    /// Spacelift hands new runs to the newest workers, so a drain that comes
    /// back busy on the OLDEST candidate means demand just arrived and the
    /// newer candidates are at least as likely to be busy; the loop stops
    /// right there instead of racing them one by one.
    async fn scale_down(&self, state: &State, count: i32) -> usize {
        let mut errors = 0usize;
        let scalable = state.scalable_workers();

        for worker in scalable.iter().take(count.max(0) as usize) {
            let (_, instance_id) = match self.controller.instance_identity(worker) {
                Ok(identity) => identity,
                Err(err) => {
                    error!(worker_id = %worker.id, error = %err, "could not resolve worker instance");
                    errors += 1;
                    continue;
                }
            };

            info!(
                worker_id = %worker.id,
                instance_id = %instance_id,
                "draining worker before termination"
            );

            match self.controller.drain_worker(&worker.id).await {
                Err(err) => {
                    error!(worker_id = %worker.id, error = %err, "could not drain worker");
                    errors += 1;
                    continue;
                }
                Ok(false) => {
                    warn!(
                        worker_id = %worker.id,
                        "worker picked up a run while draining, stopping the scale-down"
                    );
                    break;
                }
                Ok(true) => {}
            }

            if let Err(err) = self.controller.kill_instance(&instance_id).await {
                error!(
                    worker_id = %worker.id,
                    instance_id = %instance_id,
                    error = %err,
                    "could not kill instance"
                );
                errors += 1;
            }
        }

        errors
    }

    /// Detects a desired capacity drifted far above what the snapshot can
    /// justify (observed during cloud provider incidents) and resets it to
    /// a sane value before the normal decision runs. A failed reset is
    /// logged and the tick carries on against the uncorrected value.
    async fn capacity_sanity_check(&self, state: &mut State) {
        let desired = state.scale_set().desired_capacity;
        let min_size = state.scale_set().min_size;
        let max_size = state.scale_set().max_size;
        let workers = state.worker_count() as i32;
        let pending = state.pending_runs();

        let expected = workers + pending + self.limits.max_create;
        let excess = desired - expected;

        if excess < self.limits.capacity_sanity_threshold || desired <= min_size {
            return;
        }

        error!(
            desired_capacity = desired,
            valid_workers = workers,
            pending_runs = pending,
            expected_capacity = expected,
            excess,
            "desired capacity is suspiciously high, possible cloud provider issue or external modification"
        );

        let mut sane = workers + pending;
        if sane < min_size {
            sane = min_size;
        }
        if sane > max_size {
            sane = max_size;
        }

        warn!(
            current_capacity = desired,
            new_capacity = sane,
            "resetting desired capacity to a sane value"
        );

        match self.controller.scale_up(sane).await {
            Ok(()) => {
                info!(desired_capacity = sane, "desired capacity reset");
                state.apply_corrected_capacity(sane);
            }
            Err(err) => {
                error!(error = %err, "could not reset desired capacity");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use poolscale_domain::{
        GroupId, Instance, InstanceId, LifecycleState, ScaleSet, Worker, WorkerPool,
    };

    const GROUP: &str = "workers-group";

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        DescribeInstances(Vec<String>),
        DrainWorker(String),
        KillInstance(String),
        ScaleUp(i32),
    }

    /// Recording mock of the platform controller.
    struct MockController {
        pool: WorkerPool,
        scale_set: ScaleSet,
        described: Vec<Instance>,
        /// Per-worker drain outcome; defaults to `drained = true`.
        drain_results: HashMap<String, std::result::Result<bool, String>>,
        fail_kill: bool,
        fail_scale_up: bool,
        calls: Mutex<Vec<Call>>,
    }

    impl MockController {
        fn new(pool: WorkerPool, scale_set: ScaleSet) -> Self {
            Self {
                pool,
                scale_set,
                described: Vec::new(),
                drain_results: HashMap::new(),
                fail_kill: false,
                fail_scale_up: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl InstanceIdentity for MockController {
        fn instance_identity(&self, worker: &Worker) -> Result<(GroupId, InstanceId)> {
            Ok((
                GroupId(worker.metadata_value("asg_id")?),
                InstanceId(worker.metadata_value("instance_id")?),
            ))
        }
    }

    #[async_trait]
    impl Controller for MockController {
        async fn get_worker_pool(&self) -> Result<WorkerPool> {
            Ok(self.pool.clone())
        }

        async fn get_scale_set(&self) -> Result<ScaleSet> {
            Ok(self.scale_set.clone())
        }

        async fn describe_instances(&self, instance_ids: &[InstanceId]) -> Result<Vec<Instance>> {
            self.record(Call::DescribeInstances(
                instance_ids.iter().map(|id| id.0.clone()).collect(),
            ));
            Ok(self.described.clone())
        }

        async fn drain_worker(&self, worker_id: &str) -> Result<bool> {
            self.record(Call::DrainWorker(worker_id.to_string()));
            match self.drain_results.get(worker_id) {
                None => Ok(true),
                Some(Ok(drained)) => Ok(*drained),
                Some(Err(message)) => Err(DomainError::Scheduler(message.clone())),
            }
        }

        async fn kill_instance(&self, instance_id: &InstanceId) -> Result<()> {
            self.record(Call::KillInstance(instance_id.0.clone()));
            if self.fail_kill {
                return Err(DomainError::Cloud("terminate failed".to_string()));
            }
            Ok(())
        }

        async fn scale_up(&self, desired_capacity: i32) -> Result<()> {
            self.record(Call::ScaleUp(desired_capacity));
            if self.fail_scale_up {
                return Err(DomainError::Cloud("set capacity failed".to_string()));
            }
            Ok(())
        }
    }

    fn worker(id: &str, instance: &str, created_at: i64, busy: bool) -> Worker {
        Worker {
            id: id.to_string(),
            busy,
            drained: false,
            created_at,
            metadata: serde_json::json!({ "asg_id": GROUP, "instance_id": instance }).to_string(),
        }
    }

    fn pool(pending_runs: i32, workers: Vec<Worker>) -> WorkerPool {
        let mut pool = WorkerPool {
            pending_runs,
            workers,
            drained_workers: Vec::new(),
        };
        pool.normalize();
        pool
    }

    fn in_service(id: &str) -> Instance {
        Instance {
            id: InstanceId(id.to_string()),
            launch_time: None,
            lifecycle_state: LifecycleState::InService,
        }
    }

    fn scale_set(min: i32, max: i32, desired: i32, instances: Vec<Instance>) -> ScaleSet {
        ScaleSet {
            name: GROUP.to_string(),
            min_size: min,
            max_size: max,
            desired_capacity: desired,
            instances,
        }
    }

    fn described(id: &str, age_minutes: i64) -> Instance {
        Instance {
            id: InstanceId(id.to_string()),
            launch_time: Some(Utc::now() - Duration::minutes(age_minutes)),
            lifecycle_state: LifecycleState::InService,
        }
    }

    fn limits(max_create: i32, max_kill: i32) -> ScalingLimits {
        ScalingLimits {
            max_create,
            max_kill,
            ..ScalingLimits::default()
        }
    }

    fn scaler(controller: MockController, limits: ScalingLimits) -> (AutoScaler, Arc<MockController>) {
        let controller = Arc::new(controller);
        (
            AutoScaler::new(controller.clone(), limits),
            controller,
        )
    }

    #[tokio::test]
    async fn idle_at_capacity_is_a_no_op() {
        let controller = MockController::new(
            pool(0, vec![worker("w1", "i-1", 1, false), worker("w2", "i-2", 2, false)]),
            scale_set(1, 3, 2, vec![in_service("i-1"), in_service("i-2")]),
        );
        let (scaler, controller) = scaler(controller, limits(2, 2));

        scaler.scale().await.unwrap();

        assert!(controller.calls().is_empty(), "no I/O beyond the snapshot");
    }

    #[tokio::test]
    async fn pending_runs_scale_the_set_up() {
        let controller = MockController::new(
            pool(2, vec![worker("w1", "i-1", 1, false)]),
            scale_set(1, 3, 1, vec![in_service("i-1")]),
        );
        let (scaler, controller) = scaler(controller, limits(1, 1));

        scaler.scale().await.unwrap();

        assert_eq!(controller.calls(), vec![Call::ScaleUp(2)]);
    }

    #[tokio::test]
    async fn scale_down_drains_the_oldest_worker_first() {
        let controller = MockController::new(
            pool(0, vec![worker("w2", "i-2", 2, false), worker("w1", "i-1", 1, false)]),
            scale_set(1, 3, 2, vec![in_service("i-1"), in_service("i-2")]),
        );
        let (scaler, controller) = scaler(controller, limits(1, 1));

        scaler.scale().await.unwrap();

        assert_eq!(
            controller.calls(),
            vec![
                Call::DrainWorker("w1".to_string()),
                Call::KillInstance("i-1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn busy_drain_race_stops_the_whole_scale_down() {
        let mut controller = MockController::new(
            pool(0, vec![worker("w1", "i-1", 1, false), worker("w2", "i-2", 2, false)]),
            scale_set(0, 3, 2, vec![in_service("i-1"), in_service("i-2")]),
        );
        controller
            .drain_results
            .insert("w1".to_string(), Ok(false));
        let (scaler, controller) = scaler(controller, limits(1, 2));

        scaler.scale().await.unwrap();

        // w1 raced; w2 must not be drained and nothing is terminated.
        assert_eq!(controller.calls(), vec![Call::DrainWorker("w1".to_string())]);
    }

    #[tokio::test]
    async fn mature_stray_is_terminated_and_the_tick_returns() {
        let mut controller = MockController::new(
            pool(0, vec![]),
            scale_set(0, 3, 1, vec![in_service("i-1")]),
        );
        controller.described = vec![described("i-1", 15)];
        let (scaler, controller) = scaler(controller, limits(1, 1));

        scaler.scale().await.unwrap();

        assert_eq!(
            controller.calls(),
            vec![
                Call::DescribeInstances(vec!["i-1".to_string()]),
                Call::KillInstance("i-1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn immature_stray_is_skipped_and_the_tick_continues() {
        let mut controller = MockController::new(
            pool(0, vec![]),
            scale_set(0, 3, 1, vec![in_service("i-1")]),
        );
        controller.described = vec![described("i-1", 5)];
        let (scaler, controller) = scaler(controller, limits(1, 1));

        scaler.scale().await.unwrap();

        // Only the describe: the instance keeps its grace period, and the
        // worker/instance mismatch turns the decision into a no-op.
        assert_eq!(
            controller.calls(),
            vec![Call::DescribeInstances(vec!["i-1".to_string()])]
        );
    }

    #[tokio::test]
    async fn failed_stray_termination_fails_the_tick() {
        let mut controller = MockController::new(
            pool(0, vec![]),
            scale_set(0, 3, 1, vec![in_service("i-1")]),
        );
        controller.described = vec![described("i-1", 30)];
        controller.fail_kill = true;
        let (scaler, _controller) = scaler(controller, limits(1, 1));

        let err = scaler.scale().await.unwrap_err();
        assert!(matches!(err, DomainError::TickFailed { errors: 1 }));
    }

    #[tokio::test]
    async fn drifted_capacity_is_reset_before_the_decision() {
        let workers = vec![
            worker("w1", "i-1", 1, false),
            worker("w2", "i-2", 2, false),
            worker("w3", "i-3", 3, false),
        ];
        let instances = vec![in_service("i-1"), in_service("i-2"), in_service("i-3")];
        let controller = MockController::new(
            pool(5, workers),
            scale_set(3, 100, 79, instances),
        );
        let (scaler, controller) = scaler(controller, limits(20, 1));

        scaler.scale().await.unwrap();

        // Corrective reset to 3 + 5 = 8, then the normal scale-up to 10
        // (two more workers needed, within max_create).
        assert_eq!(
            controller.calls(),
            vec![Call::ScaleUp(8), Call::ScaleUp(10)]
        );
    }

    #[tokio::test]
    async fn failed_capacity_reset_does_not_abort_the_tick() {
        let workers = vec![
            worker("w1", "i-1", 1, false),
            worker("w2", "i-2", 2, false),
            worker("w3", "i-3", 3, false),
        ];
        let instances = vec![in_service("i-1"), in_service("i-2"), in_service("i-3")];
        let mut controller = MockController::new(
            pool(0, workers),
            scale_set(3, 100, 79, instances),
        );
        controller.fail_scale_up = true;
        let (scaler, controller) = scaler(controller, limits(1, 1));

        // The reset fails, and the decision afterwards is a no-op (three
        // workers at a minimum size of three), so the tick still succeeds.
        scaler.scale().await.unwrap();

        assert_eq!(controller.calls(), vec![Call::ScaleUp(3)]);
    }

    #[tokio::test]
    async fn near_threshold_capacity_is_left_alone() {
        let workers = vec![worker("w1", "i-1", 1, false)];
        let controller = MockController::new(
            pool(0, workers),
            scale_set(1, 10, 5, vec![in_service("i-1")]),
        );
        // expected = 1 + 0 + 1 = 2, excess = 3 < threshold 10.
        let (scaler, controller) = scaler(controller, limits(1, 1));

        scaler.scale().await.unwrap();

        // Only the scale-down of the single extra idle worker would apply,
        // but the pool is at its minimum; no calls at all.
        assert!(controller.calls().is_empty());
    }

    #[tokio::test]
    async fn drain_error_moves_on_to_the_next_candidate() {
        let mut controller = MockController::new(
            pool(0, vec![worker("w1", "i-1", 1, false), worker("w2", "i-2", 2, false)]),
            scale_set(0, 3, 2, vec![in_service("i-1"), in_service("i-2")]),
        );
        controller
            .drain_results
            .insert("w1".to_string(), Err("boom".to_string()));
        let (scaler, controller) = scaler(controller, limits(1, 2));

        let err = scaler.scale().await.unwrap_err();

        assert!(matches!(err, DomainError::TickFailed { errors: 1 }));
        assert_eq!(
            controller.calls(),
            vec![
                Call::DrainWorker("w1".to_string()),
                Call::DrainWorker("w2".to_string()),
                Call::KillInstance("i-2".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn kill_error_is_counted_and_reported() {
        let mut controller = MockController::new(
            pool(0, vec![worker("w1", "i-1", 1, false), worker("w2", "i-2", 2, false)]),
            scale_set(1, 3, 2, vec![in_service("i-1"), in_service("i-2")]),
        );
        controller.fail_kill = true;
        let (scaler, controller) = scaler(controller, limits(1, 1));

        let err = scaler.scale().await.unwrap_err();

        assert!(matches!(err, DomainError::TickFailed { errors: 1 }));
        assert_eq!(
            controller.calls(),
            vec![
                Call::DrainWorker("w1".to_string()),
                Call::KillInstance("i-1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn invalid_worker_metadata_aborts_the_tick() {
        let mut bad = worker("w1", "i-1", 1, false);
        bad.metadata = "{}".to_string();
        let controller = MockController::new(
            pool(0, vec![bad]),
            scale_set(1, 3, 1, vec![in_service("i-1")]),
        );
        let (scaler, controller) = scaler(controller, limits(1, 1));

        let err = scaler.scale().await.unwrap_err();

        assert!(matches!(err, DomainError::WorkerMetadata { .. }));
        assert!(controller.calls().is_empty());
    }
}
