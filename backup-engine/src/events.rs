//! Job lifecycle events fanned out to in-process subscribers.
//!
//! The control-plane server forwards these to its WebSocket clients.

use crate::jobs::{JobId, JobStatus};
use crate::kv::EntryCounts;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Maximum number of queued events per subscriber
const BROADCAST_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum JobEvent {
    #[serde(rename = "job:started")]
    Started {
        job_id: JobId,
        kind: String,
        description: String,
    },

    #[serde(rename = "job:progress")]
    Progress(JobProgressPayload),

    #[serde(rename = "job:paused")]
    Paused { job_id: JobId },

    #[serde(rename = "job:succeeded")]
    Succeeded { job_id: JobId, counts: EntryCounts },

    #[serde(rename = "job:failed")]
    Failed { job_id: JobId, error: String },

    #[serde(rename = "job:canceled")]
    Canceled { job_id: JobId },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Started { job_id, .. }
            | JobEvent::Paused { job_id }
            | JobEvent::Succeeded { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Canceled { job_id } => *job_id,
            JobEvent::Progress(p) => p.job_id,
        }
    }

    /// Event for a job that stopped in `status`, if that status is final or paused.
    pub fn for_exit(job_id: JobId, status: JobStatus, counts: EntryCounts, error: Option<String>) -> Option<Self> {
        match status {
            JobStatus::Succeeded => Some(JobEvent::Succeeded { job_id, counts }),
            JobStatus::Failed => Some(JobEvent::Failed {
                job_id,
                error: error.unwrap_or_default(),
            }),
            JobStatus::Canceled => Some(JobEvent::Canceled { job_id }),
            JobStatus::Paused => Some(JobEvent::Paused { job_id }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgressPayload {
    pub job_id: JobId,
    pub fraction: f64,
    pub chunks_done: usize,
    pub chunks_total: usize,
    pub data_size: u64,
    pub rows: u64,
}

#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn broadcast(&self, event: JobEvent) {
        match self.tx.send(event) {
            Ok(count) => debug!("Broadcast job event to {} subscriber(s)", count),
            Err(e) => debug!("No subscribers for job event: {:?}", e.0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(JobEvent::Paused { job_id: 3 }).unwrap();
        assert_eq!(json["type"], "job:paused");
        assert_eq!(json["payload"]["job_id"], 3);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let events = EventBroadcaster::new();
        let mut rx = events.subscribe();
        events.broadcast(JobEvent::Canceled { job_id: 9 });
        assert_eq!(rx.recv().await.unwrap().job_id(), 9);
    }
}
