//! System resource sensing for admission control and autoscaling.
//!
//! This crate provides:
//! - `ResourceSnapshot` - point-in-time CPU/RAM/disk/GPU readings
//! - `ResourceSensor` - the sampler, with admission checks against
//!   critical thresholds and absolute requirements
//! - `WorkloadProfile` / `ResourceEstimate` - the heuristic cost model
//!   used to size a generation job before it runs
//!
//! Sampling never fails: a sensor error degrades to a snapshot flagged
//! `degraded` with conservative (high-utilization) values, so admission
//! control fails closed instead of crashing the caller.

pub mod estimate;
pub mod sensor;
pub mod snapshot;

pub use estimate::{ResourceEstimate, WorkloadProfile};
pub use sensor::{Admission, ResourceSensor, SystemInfo};
pub use snapshot::ResourceSnapshot;
