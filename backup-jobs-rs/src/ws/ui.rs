use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use backup_engine::events::JobEvent;
use backup_engine::jobs::JobId;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

const BROADCAST_CAPACITY: usize = 256;
const MAX_QUEUE_PER_JOB: usize = 100;

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: String,
    pub timestamp: i64,
}

/// Serialized job events for WebSocket clients, with a short per-job
/// history so a reconnecting client can catch up.
#[derive(Clone)]
pub struct UiBroadcaster {
    tx: broadcast::Sender<String>,
    queue: Arc<DashMap<JobId, VecDeque<QueuedMessage>>>,
}

impl UiBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            queue: Arc::new(DashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn broadcast(&self, event: &JobEvent) {
        let msg = match serde_json::to_string(event) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Failed to serialize job event: {}", e);
                return;
            }
        };

        {
            let mut entry = self.queue.entry(event.job_id()).or_default();
            entry.push_back(QueuedMessage {
                message: msg.clone(),
                timestamp: chrono::Utc::now().timestamp_millis(),
            });
            if entry.len() > MAX_QUEUE_PER_JOB {
                entry.pop_front();
            }
        }

        let _ = self.tx.send(msg);
    }

    pub fn get_queued_messages(&self, job_id: JobId, since: i64) -> Vec<QueuedMessage> {
        self.queue
            .get(&job_id)
            .map(|q| q.iter().filter(|m| m.timestamp > since).cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for UiBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Pumps engine events into the UI broadcaster until cancelled.
pub fn start_event_forwarder(
    mut events: broadcast::Receiver<JobEvent>,
    ui: UiBroadcaster,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => ui.broadcast(&event),
                    Err(RecvError::Lagged(n)) => tracing::warn!("Event forwarder lagged by {} events", n),
                    Err(RecvError::Closed) => break,
                },
            }
        }
        tracing::info!("Event forwarder stopped");
    });
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ui_socket(socket, state))
}

/// `{"type":"replay:request","payload":{"jobId":7,"since":0}}`
fn replay_request(text: &str) -> Option<(JobId, i64)> {
    let parsed: Value = serde_json::from_str(text).ok()?;
    if parsed.get("type").and_then(|t| t.as_str()) != Some("replay:request") {
        return None;
    }
    let payload = parsed.get("payload")?;
    let job_id = payload.get("jobId").and_then(|v| v.as_i64())?;
    let since = payload.get("since").and_then(|v| v.as_i64()).unwrap_or(0);
    Some((job_id, since))
}

async fn handle_ui_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.ui.subscribe();

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Ok(msg) => {
                    if sender.send(Message::Text(msg.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => tracing::debug!("UI socket lagged by {} messages", n),
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    // Replays go to the requesting client only.
                    if let Some((job_id, since)) = replay_request(text.as_str()) {
                        for m in state.ui.get_queued_messages(job_id, since) {
                            if sender.send(Message::Text(m.message.into())).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
