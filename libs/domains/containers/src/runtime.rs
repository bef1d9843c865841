//! Container runtime abstraction over the `docker` CLI.

use crate::error::SupervisorError;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

/// A labelled container as seen by the runtime.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub image: String,
    /// Runtime state string: "running", "exited", "dead", "created", ...
    pub state: String,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// The subset of the container runtime the supervisor needs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// All containers (running or not) carrying `label=value`.
    async fn list_labelled(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<ContainerInfo>, SupervisorError>;

    /// Start a detached container from `image` with the given label,
    /// binding `container_port` to a random free loopback port. Returns
    /// the container id.
    async fn run_detached(
        &self,
        image: &str,
        label: &str,
        value: &str,
        container_port: u16,
        gpus: bool,
    ) -> Result<String, SupervisorError>;

    /// Force-remove a container (stops it first if running).
    async fn stop_and_remove(&self, container_id: &str) -> Result<(), SupervisorError>;

    /// The host port `container_port` is published on, if any.
    async fn host_port(
        &self,
        container_id: &str,
        container_port: u16,
    ) -> Result<Option<u16>, SupervisorError>;

    /// Current state string of a container.
    async fn state(&self, container_id: &str) -> Result<String, SupervisorError>;

    /// Tail of the container's log stream (stdout + stderr).
    async fn logs_tail(&self, container_id: &str, lines: u32) -> Result<String, SupervisorError>;

    /// Whether an nvidia runtime is registered with the daemon.
    async fn has_gpu_runtime(&self) -> bool;
}

/// `docker` CLI-backed runtime.
#[derive(Default)]
pub struct DockerCli;

#[derive(Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "State")]
    state: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self
    }

    async fn docker(args: &[&str]) -> Result<String, SupervisorError> {
        debug!(?args, "docker");
        let output = Command::new("docker").args(args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SupervisorError::Runtime(format!(
                "docker {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list_labelled(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<ContainerInfo>, SupervisorError> {
        let filter = format!("label={label}={value}");
        let stdout = Self::docker(&["ps", "-a", "--filter", &filter, "--format", "{{json .}}"])
            .await?;

        let mut containers = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<PsLine>(line) {
                Ok(parsed) => containers.push(ContainerInfo {
                    id: parsed.id,
                    image: parsed.image,
                    state: parsed.state,
                }),
                Err(e) => warn!("Unparseable docker ps line skipped: {e}"),
            }
        }
        Ok(containers)
    }

    async fn run_detached(
        &self,
        image: &str,
        label: &str,
        value: &str,
        container_port: u16,
        gpus: bool,
    ) -> Result<String, SupervisorError> {
        let label_arg = format!("{label}={value}");
        let publish = format!("127.0.0.1:0:{container_port}");
        let mut args = vec!["run", "-d", "--label", &label_arg, "-p", &publish];
        if gpus {
            args.extend(["--gpus", "all"]);
        }
        args.push(image);

        let stdout = Self::docker(&args).await?;
        let id = stdout.trim().to_string();
        if id.is_empty() {
            return Err(SupervisorError::Runtime(
                "docker run returned no container id".to_string(),
            ));
        }
        Ok(id)
    }

    async fn stop_and_remove(&self, container_id: &str) -> Result<(), SupervisorError> {
        Self::docker(&["rm", "-f", container_id]).await?;
        Ok(())
    }

    async fn host_port(
        &self,
        container_id: &str,
        container_port: u16,
    ) -> Result<Option<u16>, SupervisorError> {
        let spec = format!("{container_port}/tcp");
        let stdout = match Self::docker(&["port", container_id, &spec]).await {
            Ok(stdout) => stdout,
            // `docker port` fails when no mapping exists yet.
            Err(SupervisorError::Runtime(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        // Lines look like "127.0.0.1:49153".
        let port = stdout
            .lines()
            .filter_map(|line| line.trim().rsplit(':').next())
            .find_map(|p| p.parse::<u16>().ok());
        Ok(port)
    }

    async fn state(&self, container_id: &str) -> Result<String, SupervisorError> {
        let stdout =
            Self::docker(&["inspect", "-f", "{{.State.Status}}", container_id]).await?;
        Ok(stdout.trim().to_string())
    }

    async fn logs_tail(&self, container_id: &str, lines: u32) -> Result<String, SupervisorError> {
        let tail = lines.to_string();
        let output = Command::new("docker")
            .args(["logs", "--tail", &tail, container_id])
            .output()
            .await?;
        // Container logs land on both streams.
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(combined)
    }

    async fn has_gpu_runtime(&self) -> bool {
        match Self::docker(&["info", "--format", "{{json .Runtimes}}"]).await {
            Ok(stdout) => stdout.contains("nvidia"),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ps_line_parsing() {
        let line = r#"{"ID":"abc123","Image":"atelier/comfy:v1","State":"running","Names":"bold_wing"}"#;
        let parsed: PsLine = serde_json::from_str(line).unwrap();
        assert_eq!(parsed.id, "abc123");
        assert_eq!(parsed.image, "atelier/comfy:v1");
        assert_eq!(parsed.state, "running");
    }

    #[test]
    fn test_container_info_running() {
        let info = ContainerInfo {
            id: "abc".into(),
            image: "img:v1".into(),
            state: "running".into(),
        };
        assert!(info.is_running());
        let stopped = ContainerInfo {
            state: "exited".into(),
            ..info
        };
        assert!(!stopped.is_running());
    }
}
