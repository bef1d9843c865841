//! HTTP client for the inference runtime.
//!
//! The runtime exposes `/prompt` (submit), `/queue` and `/history/{id}`
//! (status), and `/view` (artifact download). Status from the two
//! endpoints is normalized into one `RuntimeStatus`.

use crate::error::GenerationError;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Pending,
    Running,
    Completed,
    Failed,
    Unknown,
}

impl RuntimeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

/// Normalized view of a prompt's progress inside the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub state: RuntimeState,
    /// 0 while running, 1-based while pending in the runtime's own queue.
    pub queue_position: Option<usize>,
    /// Output payload from history, present once completed.
    pub outputs: Option<Value>,
    pub error: Option<String>,
}

/// Result of waiting a prompt to completion.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    /// URLs under the local image-serving endpoint.
    pub images: Vec<String>,
}

/// Client for one or more runtime containers; the base URL is passed per
/// call because each workflow gets its own container.
pub struct InferenceClient {
    http: reqwest::Client,
    output_dir: PathBuf,
}

impl InferenceClient {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self {
            http,
            output_dir: output_dir.into(),
        }
    }

    /// Submit a workflow. Returns the prompt id assigned by the runtime.
    pub async fn submit(
        &self,
        base_url: &str,
        workflow: &Value,
        client_id: &str,
    ) -> Result<String, GenerationError> {
        let body = json!({"prompt": workflow, "client_id": client_id});
        let response = self
            .http
            .post(format!("{base_url}/prompt"))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(GenerationError::Runtime(format!(
                "submit rejected with {status}: {detail}"
            )));
        }

        let payload: Value = response.json().await?;
        let prompt_id = payload
            .get("prompt_id")
            .and_then(Value::as_str)
            .ok_or(GenerationError::MissingPromptId)?
            .to_string();

        info!(prompt_id = %prompt_id, "Workflow submitted to runtime");
        Ok(prompt_id)
    }

    /// Check the runtime's queue and history for a prompt.
    pub async fn status(
        &self,
        base_url: &str,
        prompt_id: &str,
    ) -> Result<RuntimeStatus, GenerationError> {
        let queue: Value = self
            .http
            .get(format!("{base_url}/queue"))
            .send()
            .await?
            .json()
            .await?;
        let history: Value = self
            .http
            .get(format!("{base_url}/history/{prompt_id}"))
            .send()
            .await?
            .json()
            .await?;

        Ok(normalize_status(prompt_id, &queue, &history))
    }

    /// Poll until the prompt completes, then download every produced image
    /// into the output directory and return their serving URLs.
    ///
    /// `on_poll` fires after every status check (progress reporting hook).
    pub async fn wait_for_completion(
        &self,
        base_url: &str,
        prompt_id: &str,
        timeout: Duration,
        mut on_poll: impl FnMut(&RuntimeStatus) + Send,
    ) -> Result<CompletionOutcome, GenerationError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let status = self.status(base_url, prompt_id).await?;
            on_poll(&status);

            match status.state {
                RuntimeState::Completed => {
                    let outputs = status.outputs.unwrap_or(Value::Null);
                    let images = self.download_outputs(base_url, prompt_id, &outputs).await?;
                    return Ok(CompletionOutcome { images });
                }
                RuntimeState::Failed => {
                    return Err(GenerationError::Runtime(
                        status
                            .error
                            .unwrap_or_else(|| "runtime reported failure".to_string()),
                    ));
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(GenerationError::Timeout(timeout.as_secs()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Download each image referenced by the history outputs, persisting
    /// as `{prompt_id}_{filename}` to avoid collisions.
    pub async fn download_outputs(
        &self,
        base_url: &str,
        prompt_id: &str,
        outputs: &Value,
    ) -> Result<Vec<String>, GenerationError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let mut urls = Vec::new();

        let Some(nodes) = outputs.as_object() else {
            return Ok(urls);
        };
        for node_output in nodes.values() {
            let Some(images) = node_output.get("images").and_then(Value::as_array) else {
                continue;
            };
            for image in images {
                let Some(filename) = image.get("filename").and_then(Value::as_str) else {
                    continue;
                };
                let image_type = image.get("type").and_then(Value::as_str).unwrap_or("output");
                let subfolder = image.get("subfolder").and_then(Value::as_str).unwrap_or("");

                let response = self
                    .http
                    .get(format!("{base_url}/view"))
                    .query(&[
                        ("filename", filename),
                        ("type", image_type),
                        ("subfolder", subfolder),
                    ])
                    .send()
                    .await?;
                if !response.status().is_success() {
                    warn!(filename, status = %response.status(), "Image download failed");
                    continue;
                }

                let bytes = response.bytes().await?;
                let local_name = format!("{prompt_id}_{filename}");
                let local_path = self.output_dir.join(&local_name);
                let mut file = tokio::fs::File::create(&local_path).await?;
                file.write_all(&bytes).await?;
                debug!(path = %local_path.display(), "Image persisted");

                urls.push(format!("/api/images/{local_name}"));
            }
        }
        Ok(urls)
    }
}

/// Normalize the runtime's queue + history payloads for one prompt.
fn normalize_status(prompt_id: &str, queue: &Value, history: &Value) -> RuntimeStatus {
    let matches_prompt = |item: &Value| {
        item.as_array()
            .and_then(|fields| fields.get(1))
            .and_then(Value::as_str)
            == Some(prompt_id)
    };

    if let Some(running) = queue.get("queue_running").and_then(Value::as_array) {
        if running.iter().any(matches_prompt) {
            return RuntimeStatus {
                state: RuntimeState::Running,
                queue_position: Some(0),
                outputs: None,
                error: None,
            };
        }
    }
    if let Some(pending) = queue.get("queue_pending").and_then(Value::as_array) {
        if let Some(index) = pending.iter().position(matches_prompt) {
            return RuntimeStatus {
                state: RuntimeState::Pending,
                queue_position: Some(index + 1),
                outputs: None,
                error: None,
            };
        }
    }

    if let Some(execution) = history.get(prompt_id) {
        let status = execution.get("status").cloned().unwrap_or(Value::Null);
        let completed = status
            .get("completed")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if completed {
            return RuntimeStatus {
                state: RuntimeState::Completed,
                queue_position: None,
                outputs: execution.get("outputs").cloned(),
                error: None,
            };
        }
        let messages = status
            .get("messages")
            .map(|m| m.to_string())
            .unwrap_or_else(|| "execution failed".to_string());
        return RuntimeStatus {
            state: RuntimeState::Failed,
            queue_position: None,
            outputs: None,
            error: Some(messages),
        };
    }

    RuntimeStatus {
        state: RuntimeState::Unknown,
        queue_position: None,
        outputs: None,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_running() {
        let queue = json!({
            "queue_running": [[0, "p1"]],
            "queue_pending": [],
        });
        let status = normalize_status("p1", &queue, &json!({}));
        assert_eq!(status.state, RuntimeState::Running);
        assert_eq!(status.queue_position, Some(0));
    }

    #[test]
    fn test_status_pending_with_position() {
        let queue = json!({
            "queue_running": [[0, "other"]],
            "queue_pending": [[1, "ahead"], [2, "p1"]],
        });
        let status = normalize_status("p1", &queue, &json!({}));
        assert_eq!(status.state, RuntimeState::Pending);
        assert_eq!(status.queue_position, Some(2));
    }

    #[test]
    fn test_status_completed_with_outputs() {
        let history = json!({
            "p1": {
                "status": {"completed": true},
                "outputs": {"26": {"images": [{"filename": "out.png"}]}},
            }
        });
        let status = normalize_status("p1", &json!({}), &history);
        assert_eq!(status.state, RuntimeState::Completed);
        assert!(status.outputs.is_some());
    }

    #[test]
    fn test_status_failed_with_messages() {
        let history = json!({
            "p1": {
                "status": {"completed": false, "messages": ["node 17 exploded"]},
            }
        });
        let status = normalize_status("p1", &json!({}), &history);
        assert_eq!(status.state, RuntimeState::Failed);
        assert!(status.error.unwrap().contains("node 17 exploded"));
    }

    #[test]
    fn test_status_unknown() {
        let status = normalize_status("p1", &json!({}), &json!({}));
        assert_eq!(status.state, RuntimeState::Unknown);
        assert!(status.queue_position.is_none());
    }

    /// What the stub runtime should report for prompt `p1`.
    #[derive(Clone, Copy)]
    enum StubOutcome {
        Completes,
        Fails,
        NeverKnown,
    }

    /// Minimal HTTP responder standing in for a runtime container: serves
    /// `/queue`, `/history/p1`, and `/view`.
    async fn spawn_runtime_stub(outcome: StubOutcome) -> u16 {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let Ok(n) = socket.read(&mut buf).await else { return };
                    let request = String::from_utf8_lossy(&buf[..n]).into_owned();
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();

                    let (content_type, body): (&str, Vec<u8>) = if path.starts_with("/history/") {
                        let payload = match outcome {
                            StubOutcome::Completes => json!({
                                "p1": {
                                    "status": {"completed": true},
                                    "outputs": {"26": {"images": [{"filename": "out.png"}]}},
                                }
                            }),
                            StubOutcome::Fails => json!({
                                "p1": {
                                    "status": {"completed": false, "messages": ["node 17 exploded"]},
                                }
                            }),
                            StubOutcome::NeverKnown => json!({}),
                        };
                        ("application/json", payload.to_string().into_bytes())
                    } else if path.starts_with("/view") {
                        ("image/png", b"\x89PNG stub bytes".to_vec())
                    } else {
                        // /queue: nothing running or pending.
                        (
                            "application/json",
                            json!({"queue_running": [], "queue_pending": []})
                                .to_string()
                                .into_bytes(),
                        )
                    };

                    let header = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: {content_type}\r\n\
                         content-length: {}\r\nconnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(header.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_wait_for_completion_downloads_images() {
        let dir = tempfile::tempdir().unwrap();
        let port = spawn_runtime_stub(StubOutcome::Completes).await;
        let client = InferenceClient::new(dir.path());

        let mut polls = 0u32;
        let outcome = client
            .wait_for_completion(
                &format!("http://127.0.0.1:{port}"),
                "p1",
                Duration::from_secs(5),
                |_status| polls += 1,
            )
            .await
            .unwrap();

        assert_eq!(outcome.images, vec!["/api/images/p1_out.png"]);
        assert!(polls >= 1, "poll hook never fired");

        // The artifact was persisted under the prompt-prefixed name.
        let bytes = std::fs::read(dir.path().join("p1_out.png")).unwrap();
        assert_eq!(bytes, b"\x89PNG stub bytes".to_vec());
    }

    #[tokio::test]
    async fn test_wait_for_completion_surfaces_runtime_failure() {
        let dir = tempfile::tempdir().unwrap();
        let port = spawn_runtime_stub(StubOutcome::Fails).await;
        let client = InferenceClient::new(dir.path());

        let err = client
            .wait_for_completion(
                &format!("http://127.0.0.1:{port}"),
                "p1",
                Duration::from_secs(5),
                |_status| {},
            )
            .await
            .unwrap_err();

        match err {
            GenerationError::Runtime(message) => assert!(message.contains("node 17 exploded")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_wait_for_completion_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let port = spawn_runtime_stub(StubOutcome::NeverKnown).await;
        let client = InferenceClient::new(dir.path());

        let mut polls = 0u32;
        let err = client
            .wait_for_completion(
                &format!("http://127.0.0.1:{port}"),
                "p1",
                Duration::ZERO,
                |_status| polls += 1,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GenerationError::Timeout(_)));
        // The deadline is checked after the status call, so exactly one
        // poll happened.
        assert_eq!(polls, 1);
    }
}
