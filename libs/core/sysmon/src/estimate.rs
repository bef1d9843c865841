use serde::{Deserialize, Serialize};

/// Shape of a generation workload, extracted from the workflow graph and
/// the user parameters before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadProfile {
    pub nodes: usize,
    pub width: u32,
    pub height: u32,
    pub batch_size: u32,
    pub steps: u32,
}

impl Default for WorkloadProfile {
    fn default() -> Self {
        Self {
            nodes: 10,
            width: 512,
            height: 512,
            batch_size: 1,
            steps: 20,
        }
    }
}

/// Estimated resource requirements for a workload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceEstimate {
    pub memory_mb: f64,
    pub disk_mb: f64,
    pub seconds: f64,
}

const BASE_MEMORY_MB: f64 = 512.0;
const BASE_DISK_MB: f64 = 100.0;
const MEMORY_PER_NODE_MB: f64 = 50.0;
const MEMORY_PER_MEGAPIXEL_MB: f64 = 100.0;
const MEMORY_PER_STEP_MB: f64 = 10.0;
const MEMORY_SAFETY_FACTOR: f64 = 1.5;
const DISK_SAFETY_FACTOR: f64 = 2.0;
const PNG_BYTES_PER_PIXEL: f64 = 4.0;
const SECONDS_PER_STEP: f64 = 0.5;

/// Heuristic cost model for a generation workload.
///
/// base + per-node overhead + per-megapixel factor + per-step factor, with
/// a 1.5x safety factor on memory and 2x on disk.
pub fn estimate(profile: &WorkloadProfile) -> ResourceEstimate {
    let pixel_count = f64::from(profile.width) * f64::from(profile.height)
        * f64::from(profile.batch_size);
    let megapixels = pixel_count / 1_000_000.0;

    let mut memory_mb = BASE_MEMORY_MB + profile.nodes as f64 * MEMORY_PER_NODE_MB;
    memory_mb += megapixels * MEMORY_PER_MEGAPIXEL_MB;
    memory_mb += f64::from(profile.steps) * MEMORY_PER_STEP_MB;
    memory_mb *= MEMORY_SAFETY_FACTOR;

    let mut disk_mb = BASE_DISK_MB
        + pixel_count * PNG_BYTES_PER_PIXEL * f64::from(profile.batch_size) / 1_000_000.0;
    disk_mb *= DISK_SAFETY_FACTOR;

    let seconds = f64::from(profile.steps) * SECONDS_PER_STEP * f64::from(profile.batch_size);

    ResourceEstimate {
        memory_mb: memory_mb.round(),
        disk_mb: disk_mb.round(),
        seconds: seconds.round(),
    }
}
