//! The supervisor: one healthy runtime container per workflow.

use crate::error::SupervisorError;
use crate::runtime::ContainerRuntime;
use database::BuildStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Label attached to every container the supervisor manages.
pub const LABEL_KEY: &str = "atelier.workflow_id";
/// Port the inference runtime listens on inside the container.
pub const RUNTIME_PORT: u16 = 8188;

const READY_TIMEOUT_SECS: u64 = 60;
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);
const LOG_TAIL_LINES: u32 = 200;

/// Ensures a running, reachable inference container per workflow.
///
/// `ensure` holds one lock for its whole duration so concurrent calls for
/// the same (or different) workflows cannot race each other into starting
/// duplicate containers.
pub struct ContainerSupervisor {
    store: Arc<dyn BuildStore>,
    runtime: Arc<dyn ContainerRuntime>,
    http: reqwest::Client,
    lock: Mutex<()>,
}

impl ContainerSupervisor {
    pub fn new(store: Arc<dyn BuildStore>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(1500))
            .build()
            .expect("reqwest client");
        Self {
            store,
            runtime,
            http,
            lock: Mutex::new(()),
        }
    }

    /// Ensure a container for `workflow_id` is running and reachable.
    /// Returns its base URL (e.g. `http://127.0.0.1:49153`).
    pub async fn ensure(&self, workflow_id: &str) -> Result<String, SupervisorError> {
        let _guard = self.lock.lock().await;

        let build = self
            .store
            .latest_successful(workflow_id)
            .await?
            .ok_or_else(|| SupervisorError::BuildRequired(workflow_id.to_string()))?;
        let desired_image = build.image_reference();

        let containers = self.runtime.list_labelled(LABEL_KEY, workflow_id).await?;

        // Reuse a running container already on the desired image, as long
        // as it exposes the runtime port.
        let mut reusable = None;
        for container in &containers {
            if container.is_running() && container.image == desired_image {
                reusable = Some(container.id.clone());
                break;
            }
        }
        if let Some(id) = &reusable {
            if let Some(port) = self.runtime.host_port(id, RUNTIME_PORT).await? {
                return Ok(format!("http://127.0.0.1:{port}"));
            }
            // Running but unreachable; recreate it below.
            warn!(container = %id, workflow_id, "Container has no port mapping, recreating");
        }

        // Reap everything labelled for this workflow before promoting a
        // replacement, so at most one is ever running.
        for container in &containers {
            if let Err(e) = self.runtime.stop_and_remove(&container.id).await {
                warn!(container = %container.id, "Failed to remove stale container: {e}");
            }
        }

        let gpus = self.runtime.has_gpu_runtime().await;
        let container_id = self
            .runtime
            .run_detached(&desired_image, LABEL_KEY, workflow_id, RUNTIME_PORT, gpus)
            .await?;
        info!(workflow_id, container = %container_id, image = %desired_image, gpus, "Started runtime container");

        self.wait_ready(&container_id).await
    }

    /// Stop every labelled container for the workflow, then `ensure` a
    /// fresh one.
    pub async fn restart(&self, workflow_id: &str) -> Result<String, SupervisorError> {
        {
            let _guard = self.lock.lock().await;
            let containers = self.runtime.list_labelled(LABEL_KEY, workflow_id).await?;
            for container in containers {
                if let Err(e) = self.runtime.stop_and_remove(&container.id).await {
                    warn!(container = %container.id, "Failed to remove container on restart: {e}");
                }
            }
        }
        self.ensure(workflow_id).await
    }

    /// Tail of the first labelled container's logs.
    pub async fn logs(&self, workflow_id: &str, tail_lines: u32) -> Result<String, SupervisorError> {
        let containers = self.runtime.list_labelled(LABEL_KEY, workflow_id).await?;
        let Some(container) = containers.first() else {
            return Err(SupervisorError::Runtime(format!(
                "No container found for workflow {workflow_id}"
            )));
        };
        self.runtime.logs_tail(&container.id, tail_lines).await
    }

    /// Poll the container until it answers HTTP on its mapped port.
    async fn wait_ready(&self, container_id: &str) -> Result<String, SupervisorError> {
        let mut host_port = None;

        for _ in 0..READY_TIMEOUT_SECS {
            if host_port.is_none() {
                host_port = self.runtime.host_port(container_id, RUNTIME_PORT).await?;
            }

            if let Some(port) = host_port {
                let url = format!("http://127.0.0.1:{port}/");
                match self.http.get(&url).send().await {
                    Ok(response) if response.status().as_u16() < 500 => {
                        return Ok(format!("http://127.0.0.1:{port}"));
                    }
                    _ => {}
                }
            }

            let state = self.runtime.state(container_id).await?;
            if state == "exited" || state == "dead" {
                let logs = self
                    .runtime
                    .logs_tail(container_id, LOG_TAIL_LINES)
                    .await
                    .unwrap_or_default();
                return Err(SupervisorError::StartupFailed { logs });
            }

            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }

        // Port is mapped but readiness never confirmed: hand the URL out
        // anyway and let the caller's own requests decide.
        if let Some(port) = host_port {
            warn!(container = %container_id, "Readiness not confirmed within budget, returning URL");
            return Ok(format!("http://127.0.0.1:{port}"));
        }
        Err(SupervisorError::NotReady {
            port: RUNTIME_PORT,
            timeout_secs: READY_TIMEOUT_SECS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerInfo, MockContainerRuntime};
    use database::{BuildStatus, NewBuild, SqliteBuildStore};
    use tokio::io::AsyncWriteExt;

    async fn store_with_build(workflow_id: &str) -> Arc<SqliteBuildStore> {
        let store = SqliteBuildStore::new(database::connect_in_memory().await.unwrap());
        let build = store
            .create(NewBuild {
                workflow_id: workflow_id.to_string(),
                image_name: "atelier/comfy".to_string(),
                tag: "v1".to_string(),
            })
            .await
            .unwrap();
        store.set_status(&build.id, BuildStatus::Completed).await.unwrap();
        Arc::new(store)
    }

    /// Minimal HTTP responder standing in for the runtime container.
    async fn spawn_http_stub() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                        .await;
                });
            }
        });
        port
    }

    fn container(id: &str, image: &str, state: &str) -> ContainerInfo {
        ContainerInfo {
            id: id.to_string(),
            image: image.to_string(),
            state: state.to_string(),
        }
    }

    #[tokio::test]
    async fn test_ensure_without_build_is_rejected() {
        let store = SqliteBuildStore::new(database::connect_in_memory().await.unwrap());
        let runtime = MockContainerRuntime::new();
        let supervisor = ContainerSupervisor::new(Arc::new(store), Arc::new(runtime));

        let err = supervisor.ensure("wf-none").await.unwrap_err();
        assert!(matches!(err, SupervisorError::BuildRequired(_)));
    }

    #[tokio::test]
    async fn test_ensure_reuses_running_container_on_desired_image() {
        let store = store_with_build("wf-1").await;
        let port = spawn_http_stub().await;

        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_list_labelled()
            .returning(|_, _| Ok(vec![container("c1", "atelier/comfy:v1", "running")]));
        runtime
            .expect_host_port()
            .withf(|id, _| id == "c1")
            .returning(move |_, _| Ok(Some(port)));
        // No run_detached, no stop_and_remove expected.

        let supervisor = ContainerSupervisor::new(store, Arc::new(runtime));
        let url = supervisor.ensure("wf-1").await.unwrap();
        assert_eq!(url, format!("http://127.0.0.1:{port}"));
    }

    #[tokio::test]
    async fn test_ensure_replaces_stale_container() {
        let store = store_with_build("wf-1").await;
        let port = spawn_http_stub().await;

        let mut runtime = MockContainerRuntime::new();
        // Stale: old image, stopped.
        runtime
            .expect_list_labelled()
            .returning(|_, _| Ok(vec![container("old", "atelier/comfy:v0", "exited")]));
        runtime
            .expect_stop_and_remove()
            .withf(|id| id == "old")
            .times(1)
            .returning(|_| Ok(()));
        runtime.expect_has_gpu_runtime().returning(|| false);
        runtime
            .expect_run_detached()
            .withf(|image, label, value, port, gpus| {
                image == "atelier/comfy:v1"
                    && label == LABEL_KEY
                    && value == "wf-1"
                    && *port == RUNTIME_PORT
                    && !*gpus
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok("fresh".to_string()));
        runtime
            .expect_host_port()
            .withf(|id, _| id == "fresh")
            .returning(move |_, _| Ok(Some(port)));
        runtime.expect_state().returning(|_| Ok("running".to_string()));

        let supervisor = ContainerSupervisor::new(store, Arc::new(runtime));
        let url = supervisor.ensure("wf-1").await.unwrap();
        assert_eq!(url, format!("http://127.0.0.1:{port}"));
    }

    #[tokio::test]
    async fn test_ensure_surfaces_startup_logs_on_exit() {
        let store = store_with_build("wf-1").await;

        let mut runtime = MockContainerRuntime::new();
        runtime.expect_list_labelled().returning(|_, _| Ok(vec![]));
        runtime.expect_has_gpu_runtime().returning(|| false);
        runtime
            .expect_run_detached()
            .returning(|_, _, _, _, _| Ok("crashy".to_string()));
        runtime.expect_host_port().returning(|_, _| Ok(None));
        runtime.expect_state().returning(|_| Ok("exited".to_string()));
        runtime
            .expect_logs_tail()
            .returning(|_, _| Ok("CUDA driver missing".to_string()));

        let supervisor = ContainerSupervisor::new(store, Arc::new(runtime));
        match supervisor.ensure("wf-1").await.unwrap_err() {
            SupervisorError::StartupFailed { logs } => {
                assert!(logs.contains("CUDA driver missing"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_restart_reaps_all_then_starts() {
        let store = store_with_build("wf-1").await;
        let port = spawn_http_stub().await;

        let mut runtime = MockContainerRuntime::new();
        let mut call = 0;
        runtime.expect_list_labelled().returning(move |_, _| {
            call += 1;
            if call == 1 {
                // restart pass sees two labelled containers
                Ok(vec![
                    container("a", "atelier/comfy:v1", "running"),
                    container("b", "atelier/comfy:v0", "exited"),
                ])
            } else {
                // ensure pass after the reap
                Ok(vec![])
            }
        });
        runtime.expect_stop_and_remove().times(2).returning(|_| Ok(()));
        runtime.expect_has_gpu_runtime().returning(|| false);
        runtime
            .expect_run_detached()
            .times(1)
            .returning(|_, _, _, _, _| Ok("fresh".to_string()));
        runtime
            .expect_host_port()
            .returning(move |_, _| Ok(Some(port)));
        runtime.expect_state().returning(|_| Ok("running".to_string()));

        let supervisor = ContainerSupervisor::new(store, Arc::new(runtime));
        let url = supervisor.restart("wf-1").await.unwrap();
        assert_eq!(url, format!("http://127.0.0.1:{port}"));
    }

    #[tokio::test]
    async fn test_logs_requires_a_container() {
        let store = store_with_build("wf-1").await;
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_list_labelled().returning(|_, _| Ok(vec![]));

        let supervisor = ContainerSupervisor::new(store, Arc::new(runtime));
        let err = supervisor.logs("wf-1", 50).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Runtime(_)));
    }
}
