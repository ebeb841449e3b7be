use serde::Deserialize;

use crate::worker::Worker;

/// The Spacelift side of the snapshot.
///
/// After [`normalize`](WorkerPool::normalize), `workers` holds only live
/// workers sorted ascending by creation time. Spacelift prefers the newest
/// workers for new runs, so the oldest worker is the safest one to drain
/// first; the scale-down protocol relies on this order.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerPool {
    pub pending_runs: i32,
    pub workers: Vec<Worker>,
    /// Drained workers set aside by [`normalize`](WorkerPool::normalize).
    /// They no longer take part in scale math, but the stray detection still
    /// needs them to recognize a previously failed scale-down.
    #[serde(skip)]
    pub drained_workers: Vec<Worker>,
}

impl WorkerPool {
    /// Moves drained workers out of the live list and stable-sorts the
    /// remainder oldest-first. The scheduler adapter calls this before the
    /// pool reaches the snapshot loader.
    pub fn normalize(&mut self) {
        let (drained, mut live): (Vec<Worker>, Vec<Worker>) =
            std::mem::take(&mut self.workers).into_iter().partition(|worker| worker.drained);

        live.sort_by_key(|worker| worker.created_at);

        self.workers = live;
        self.drained_workers = drained;
    }
}
