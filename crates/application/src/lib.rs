//! The reconciliation driver: composes the snapshot, the sanity check, the
//! stray-instance policy and the decision engine into a single tick.

pub mod auto_scaler;

pub use auto_scaler::AutoScaler;
