//! Tracks which jobs this process is currently running.

use super::JobId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

/// Dropped by the job task when it exits.
pub type ExitGuard = watch::Sender<()>;

#[derive(Clone, Default)]
pub struct JobTracker {
    jobs: Arc<RwLock<HashMap<JobId, watch::Receiver<()>>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a local run; `None` when the job already runs here.
    pub async fn register(&self, job_id: JobId) -> Option<ExitGuard> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job_id) {
            return None;
        }
        let (tx, rx) = watch::channel(());
        jobs.insert(job_id, rx);
        Some(tx)
    }

    /// Remove a job from tracking (called when its task finishes)
    pub async fn complete(&self, job_id: JobId) {
        self.jobs.write().await.remove(&job_id);
    }

    pub async fn is_running(&self, job_id: JobId) -> bool {
        self.jobs.read().await.contains_key(&job_id)
    }

    /// Waits until the local run of `job_id`, if any, has exited.
    pub async fn wait(&self, job_id: JobId) {
        let rx = self.jobs.read().await.get(&job_id).cloned();
        if let Some(mut rx) = rx {
            while rx.changed().await.is_ok() {}
        }
    }

    pub async fn running_count(&self) -> usize {
        self.jobs.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_local_run() {
        let tracker = JobTracker::new();
        let guard = tracker.register(1).await.unwrap();
        assert!(tracker.register(1).await.is_none());
        assert_eq!(tracker.running_count().await, 1);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait(1).await })
        };
        tracker.complete(1).await;
        drop(guard);
        waiter.await.unwrap();
        assert!(!tracker.is_running(1).await);
        tracker.wait(1).await;
    }
}
