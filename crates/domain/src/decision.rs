use crate::state::State;

/// Which way a tick moves the scale set, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDirection {
    None,
    Up,
    Down,
}

/// The outcome of the decision engine. `comments` always explains the
/// decision, including every constraint that clipped the size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub direction: ScalingDirection,
    pub scaling_size: i32,
    pub comments: Vec<String>,
}

impl Decision {
    fn none(comment: impl Into<String>) -> Self {
        Self {
            direction: ScalingDirection::None,
            scaling_size: 0,
            comments: vec![comment.into()],
        }
    }
}

impl State {
    /// Decides what this tick should do, as a pure function of the snapshot.
    ///
    /// A worker/instance count mismatch means one side has not caught up
    /// with the other (a dead worker, a still-pending instance); scale math
    /// over such a snapshot is unreliable, so the tick waits for
    /// convergence instead.
    pub fn decide(&self, max_create: i32, max_kill: i32) -> Decision {
        if self.worker_count() != self.instance_count() {
            return Decision::none(
                "number of workers does not match the number of instances in the scale set",
            );
        }

        let difference = self.pending_runs() - self.scalable_workers().len() as i32;

        if difference > 0 {
            return self.determine_scale_up(difference, max_create);
        }

        if difference < 0 {
            return self.determine_scale_down(-difference, max_kill);
        }

        Decision::none("scale set exactly at the right size")
    }

    fn determine_scale_up(&self, missing_workers: i32, max_create: i32) -> Decision {
        let scale_set = self.scale_set();

        if self.worker_count() as i32 >= scale_set.max_size {
            return Decision::none("scale set is already at maximum size");
        }

        let mut comments = Vec::new();
        let mut missing_workers = missing_workers;

        if missing_workers > max_create {
            comments.push(format!(
                "need {missing_workers} workers, but can only create {max_create}"
            ));
            missing_workers = max_create;
        }

        let new_capacity = scale_set.desired_capacity + missing_workers;

        if new_capacity <= scale_set.max_size {
            comments.push(format!(
                "adding {missing_workers} workers to match pending runs"
            ));
            return Decision {
                direction: ScalingDirection::Up,
                scaling_size: missing_workers,
                comments,
            };
        }

        let scaling_size = scale_set.max_size - scale_set.desired_capacity;
        comments.push(format!(
            "adding {scaling_size} workers to match pending runs, up to the scale set max size"
        ));

        Decision {
            direction: ScalingDirection::Up,
            scaling_size,
            comments,
        }
    }

    fn determine_scale_down(&self, extra_workers: i32, max_kill: i32) -> Decision {
        let scale_set = self.scale_set();

        if self.worker_count() as i32 <= scale_set.min_size {
            return Decision::none("scale set is already at minimum size");
        }

        let mut comments = Vec::new();
        let mut extra_workers = extra_workers;

        if extra_workers > max_kill {
            comments.push(format!(
                "need to kill {extra_workers} workers, but can only kill {max_kill}"
            ));
            extra_workers = max_kill;
        }

        let over_minimum = scale_set.desired_capacity - scale_set.min_size;
        if extra_workers > over_minimum {
            comments.push(format!(
                "need to kill {extra_workers} workers, but can't get below minimum size of {}",
                scale_set.min_size
            ));
            extra_workers = over_minimum;
        }

        comments.push(format!("removing {extra_workers} idle workers"));

        Decision {
            direction: ScalingDirection::Down,
            scaling_size: extra_workers,
            comments,
        }
    }
}
