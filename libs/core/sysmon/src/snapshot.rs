use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable resource usage snapshot.
///
/// GPU fields are `None` when no GPU is present or the probe failed;
/// absence is not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_mb: f64,
    pub memory_available_mb: f64,
    pub disk_usage_percent: f64,
    pub gpu_memory_used_mb: Option<f64>,
    pub gpu_memory_total_mb: Option<f64>,
    pub gpu_utilization: Option<f64>,
    /// Set when the sensor could not produce a real reading and
    /// substituted conservative values.
    pub degraded: bool,
    pub sampled_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    /// Check if resources are within safe limits.
    pub fn is_within_limits(
        &self,
        max_cpu_percent: f64,
        max_memory_percent: f64,
        max_disk_percent: f64,
    ) -> bool {
        if self.cpu_percent > max_cpu_percent {
            return false;
        }
        if self.memory_percent > max_memory_percent {
            return false;
        }
        self.disk_usage_percent <= max_disk_percent
    }

    /// GPU memory utilization as a percentage, when both GPU memory
    /// readings are present.
    pub fn gpu_memory_percent(&self) -> Option<f64> {
        match (self.gpu_memory_used_mb, self.gpu_memory_total_mb) {
            (Some(used), Some(total)) if total > 0.0 => Some(used / total * 100.0),
            _ => None,
        }
    }

    /// Conservative stand-in used when sampling itself fails: everything
    /// reads as saturated, so admission checks reject new work.
    pub fn saturated() -> Self {
        Self {
            cpu_percent: 100.0,
            memory_percent: 100.0,
            memory_used_mb: f64::MAX,
            memory_available_mb: 0.0,
            disk_usage_percent: 100.0,
            gpu_memory_used_mb: None,
            gpu_memory_total_mb: None,
            gpu_utilization: None,
            degraded: true,
            sampled_at: Utc::now(),
        }
    }
}
