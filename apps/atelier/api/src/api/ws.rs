//! WebSocket endpoint bridging sockets to the progress bus.
//!
//! Each socket becomes one bus subscriber keyed by a fresh client id; the
//! bus's channel receiver is pumped into the socket by a forward task
//! while this handler drains inbound frames.

use crate::state::AppState;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use progress_bus::{BusError, InboundMessage, ProgressEvent};
use task_queue::JobState;
use tracing::{debug, info};
use uuid::Uuid;

/// GET /ws/{prompt_id}
pub async fn websocket_progress(
    State(state): State<AppState>,
    Path(prompt_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket, prompt_id))
}

async fn handle_socket(state: AppState, mut socket: WebSocket, prompt_id: String) {
    let client_id = format!(
        "client-{}-{}",
        prompt_id,
        &Uuid::new_v4().simple().to_string()[..8]
    );

    let receiver = match state
        .bus
        .subscribe(&client_id, Some(prompt_id.clone()), None)
        .await
    {
        Ok(receiver) => receiver,
        Err(BusError::AtCapacity(_)) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "Max connections reached".into(),
                })))
                .await;
            return;
        }
    };

    // Late subscribers get an immediate snapshot of where the job stands.
    send_snapshot(&state, &client_id, &prompt_id).await;

    let (mut sink, mut stream) = socket.split();
    let forward = tokio::spawn(async move {
        let mut receiver = receiver;
        while let Some(event) = receiver.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<InboundMessage>(&text) {
                Ok(inbound) => state.bus.handle_inbound(&client_id, inbound).await,
                Err(e) => debug!(client_id = %client_id, "Unrecognized frame dropped: {e}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!(client_id = %client_id, "WebSocket closed");
    state.bus.unsubscribe(&client_id).await;
    forward.abort();
}

/// Push the job's current standing to a fresh subscriber.
async fn send_snapshot(state: &AppState, client_id: &str, prompt_id: &str) {
    let Some(job) = state.queue.find_by_prompt(prompt_id).await else {
        return;
    };

    let event = match job.state {
        JobState::Completed => ProgressEvent::ExecutionComplete {
            prompt_id: prompt_id.to_string(),
            status: "completed".to_string(),
            images: job.result.as_ref().map(|r| r.images.clone()),
            error: None,
            total_time: job.result.as_ref().map(|r| r.elapsed_seconds),
        },
        JobState::Failed | JobState::TimedOut => ProgressEvent::ExecutionComplete {
            prompt_id: prompt_id.to_string(),
            status: "failed".to_string(),
            images: None,
            error: job.error.clone(),
            total_time: None,
        },
        JobState::Cancelled => ProgressEvent::ExecutionComplete {
            prompt_id: prompt_id.to_string(),
            status: "cancelled".to_string(),
            images: None,
            error: None,
            total_time: None,
        },
        _ => ProgressEvent::QueueUpdate {
            prompt_id: prompt_id.to_string(),
            queue_position: state.queue.position(&job.job_id).await,
        },
    };
    state.bus.send(client_id, event).await;
}
