//! Domain model of the autoscaler: the joined snapshot of a Spacelift worker
//! pool and a cloud scale set, the queries derived from it, and the pure
//! scale-decision engine.
//!
//! This crate deliberately knows nothing about HTTP, GraphQL or any cloud
//! SDK. Platform back-ends implement the [`Controller`] capability and plug
//! in from the infrastructure layer.

pub mod controller;
pub mod decision;
pub mod error;
pub mod scale_set;
pub mod state;
pub mod worker;
pub mod worker_pool;

#[cfg(test)]
pub(crate) mod test_support;

pub use controller::{Controller, InstanceIdentity};
pub use decision::{Decision, ScalingDirection};
pub use error::{DomainError, Result};
pub use scale_set::{Instance, LifecycleState, ScaleSet};
pub use state::State;
pub use worker::{GroupId, InstanceId, Worker};
pub use worker_pool::WorkerPool;
