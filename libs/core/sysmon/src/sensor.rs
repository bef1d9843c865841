use crate::estimate::{estimate, ResourceEstimate, WorkloadProfile};
use crate::snapshot::ResourceSnapshot;
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use sysinfo::{Disks, System};
use tracing::{debug, info, warn};

/// Critical thresholds above which no new work is admitted.
///
/// Relaxed on purpose: generation workloads legitimately run hot, and the
/// executor applies its own, stricter soft limits.
#[derive(Debug, Clone, Copy)]
pub struct CriticalThresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub gpu_memory_percent: f64,
}

impl Default for CriticalThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 99.0,
            memory_percent: 98.0,
            disk_percent: 99.0,
            gpu_memory_percent: 99.0,
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Serialize)]
pub struct Admission {
    pub ok: bool,
    pub reason: String,
}

impl Admission {
    fn granted() -> Self {
        Self {
            ok: true,
            reason: "Resources available".to_string(),
        }
    }

    fn denied(reason: String) -> Self {
        Self { ok: false, reason }
    }
}

/// Static description of the host, for the resources endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub cpu_count: usize,
    pub memory_total_gb: f64,
    pub disk_total_gb: f64,
    pub platform: String,
    pub gpu_name: Option<String>,
}

/// Samples CPU, RAM, disk, and (optionally) GPU utilization.
///
/// The GPU probe shells out to `nvidia-smi`; when the binary is missing or
/// errors, the three gpu_* snapshot fields degrade to `None`.
pub struct ResourceSensor {
    system: Mutex<System>,
    output_dir: PathBuf,
    thresholds: CriticalThresholds,
    has_gpu: bool,
}

impl ResourceSensor {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        let output_dir = output_dir.into();
        let has_gpu = probe_gpu_available();
        info!(output_dir = %output_dir.display(), gpu = has_gpu, "Resource sensor initialized");

        Self {
            system: Mutex::new(System::new()),
            output_dir,
            thresholds: CriticalThresholds::default(),
            has_gpu,
        }
    }

    pub fn with_thresholds(mut self, thresholds: CriticalThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn has_gpu(&self) -> bool {
        self.has_gpu
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Take a point-in-time reading. Never fails: if the underlying probe
    /// is unusable the snapshot comes back `degraded` and saturated so
    /// admission checks reject rather than admit blindly.
    pub fn sample(&self) -> ResourceSnapshot {
        let Ok(mut system) = self.system.lock() else {
            warn!("Resource sampler lock poisoned, reporting saturated snapshot");
            return ResourceSnapshot::saturated();
        };

        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu_percent = f64::from(system.global_cpu_usage());
        let total = system.total_memory() as f64;
        let used = system.used_memory() as f64;
        let available = system.available_memory() as f64;
        let memory_percent = if total > 0.0 { used / total * 100.0 } else { 100.0 };

        let (disk_usage_percent, _disk_available_mb) = self.disk_usage();

        let (gpu_memory_used_mb, gpu_memory_total_mb, gpu_utilization) = if self.has_gpu {
            match probe_gpu_stats() {
                Some((used, total, util)) => (Some(used), Some(total), util),
                None => (None, None, None),
            }
        } else {
            (None, None, None)
        };

        ResourceSnapshot {
            cpu_percent,
            memory_percent,
            memory_used_mb: used / (1024.0 * 1024.0),
            memory_available_mb: available / (1024.0 * 1024.0),
            disk_usage_percent,
            gpu_memory_used_mb,
            gpu_memory_total_mb,
            gpu_utilization,
            degraded: false,
            sampled_at: Utc::now(),
        }
    }

    /// Check whether a workload with the given absolute requirements can be
    /// admitted right now.
    ///
    /// Checks a live snapshot against the critical thresholds AND the
    /// requirements against current availability.
    pub fn admit(&self, required_memory_mb: f64, required_disk_mb: f64) -> Admission {
        let usage = self.sample();

        if usage.cpu_percent > self.thresholds.cpu_percent {
            return Admission::denied(format!("CPU usage too high: {:.1}%", usage.cpu_percent));
        }

        if usage.memory_available_mb < required_memory_mb {
            return Admission::denied(format!(
                "Insufficient memory: {:.0}MB available, {:.0}MB required",
                usage.memory_available_mb, required_memory_mb
            ));
        }

        if usage.memory_percent > self.thresholds.memory_percent {
            return Admission::denied(format!(
                "Memory usage too high: {:.1}%",
                usage.memory_percent
            ));
        }

        let (disk_percent, disk_available_mb) = self.disk_usage();
        if disk_available_mb < required_disk_mb {
            return Admission::denied(format!(
                "Insufficient disk space: {:.0}MB available, {:.0}MB required",
                disk_available_mb, required_disk_mb
            ));
        }

        if disk_percent > self.thresholds.disk_percent {
            return Admission::denied(format!("Disk usage too high: {:.1}%", disk_percent));
        }

        if let Some(gpu_percent) = usage.gpu_memory_percent() {
            if gpu_percent > self.thresholds.gpu_memory_percent {
                return Admission::denied(format!(
                    "GPU memory usage too high: {:.1}%",
                    gpu_percent
                ));
            }
        }

        Admission::granted()
    }

    /// Estimate resource requirements for a workload.
    pub fn estimate(&self, profile: &WorkloadProfile) -> ResourceEstimate {
        estimate(profile)
    }

    /// Static host description for the resources endpoint.
    pub fn system_info(&self) -> SystemInfo {
        let (cpu_count, memory_total_gb) = {
            let Ok(mut system) = self.system.lock() else {
                return SystemInfo {
                    cpu_count: 0,
                    memory_total_gb: 0.0,
                    disk_total_gb: 0.0,
                    platform: String::new(),
                    gpu_name: None,
                };
            };
            system.refresh_cpu_usage();
            system.refresh_memory();
            (
                system.cpus().len(),
                system.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            )
        };

        let disk_total_gb = self
            .find_disk(|disk| disk.total_space() as f64 / (1024.0 * 1024.0 * 1024.0))
            .unwrap_or(0.0);

        SystemInfo {
            cpu_count,
            memory_total_gb,
            disk_total_gb,
            platform: System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
            gpu_name: if self.has_gpu { probe_gpu_name() } else { None },
        }
    }

    /// Remove output files older than `max_age_hours` to free disk space.
    pub fn cleanup_old_outputs(&self, max_age_hours: u64) {
        let max_age = Duration::from_secs(max_age_hours * 3600);
        let now = SystemTime::now();
        let mut cleaned_count = 0u64;
        let mut cleaned_bytes = 0u64;

        let mut stack = vec![self.output_dir.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Ok(meta) = entry.metadata() else { continue };
                let Ok(modified) = meta.modified() else { continue };
                let Ok(age) = now.duration_since(modified) else { continue };
                if age > max_age && std::fs::remove_file(&path).is_ok() {
                    cleaned_count += 1;
                    cleaned_bytes += meta.len();
                }
            }
        }

        if cleaned_count > 0 {
            info!(
                files = cleaned_count,
                freed_mb = cleaned_bytes / (1024 * 1024),
                "Cleaned up old output files"
            );
        }
    }

    /// Usage percentage and available MB of the disk backing the output
    /// directory. Missing disk reads as full.
    fn disk_usage(&self) -> (f64, f64) {
        match self.find_disk(|disk| {
            let total = disk.total_space() as f64;
            let available = disk.available_space() as f64;
            let percent = if total > 0.0 {
                (total - available) / total * 100.0
            } else {
                100.0
            };
            (percent, available / (1024.0 * 1024.0))
        }) {
            Some(result) => result,
            None => {
                debug!(output_dir = %self.output_dir.display(), "No disk found for output directory");
                (100.0, 0.0)
            }
        }
    }

    /// Apply `f` to the disk with the longest mount-point prefix of the
    /// output directory.
    fn find_disk<T>(&self, f: impl Fn(&sysinfo::Disk) -> T) -> Option<T> {
        let disks = Disks::new_with_refreshed_list();
        disks
            .iter()
            .filter(|disk| self.output_dir.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| f(disk))
    }
}

fn probe_gpu_available() -> bool {
    Command::new("nvidia-smi")
        .arg("-L")
        .output()
        .map(|out| out.status.success() && !out.stdout.is_empty())
        .unwrap_or(false)
}

/// Query GPU memory and utilization through nvidia-smi.
///
/// Returns (used_mb, total_mb, utilization_percent).
fn probe_gpu_stats() -> Option<(f64, f64, Option<f64>)> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=memory.used,memory.total,utilization.gpu",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let line = text.lines().next()?;
    let mut fields = line.split(',').map(str::trim);

    let used: f64 = fields.next()?.parse().ok()?;
    let total: f64 = fields.next()?.parse().ok()?;
    let utilization = fields.next().and_then(|v| v.parse().ok());

    Some((used, total, utilization))
}

fn probe_gpu_name() -> Option<String> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let name = text.lines().next()?.trim();
    (!name.is_empty()).then(|| name.to_string())
}
