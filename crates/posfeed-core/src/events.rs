//! Job progress events and the broadcast bus that carries them.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobEvent {
    Started {
        job_id: String,
        message: String,
    },
    FileStart {
        job_id: String,
        branch: String,
        pos: u32,
        date: String,
        file: String,
    },
    Progress {
        job_id: String,
        file: String,
        batch_rows: u64,
        total_rows: u64,
    },
    Skipped {
        job_id: String,
        file: String,
        reason: String,
    },
    FileComplete {
        job_id: String,
        file: String,
        rows: u64,
        files_completed: u64,
        files_total: u64,
    },
    Error {
        job_id: String,
        file: Option<String>,
        message: String,
    },
    Complete {
        job_id: String,
        rows_inserted: u64,
        files_completed: u64,
        files_total: u64,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Started { job_id, .. }
            | JobEvent::FileStart { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Skipped { job_id, .. }
            | JobEvent::FileComplete { job_id, .. }
            | JobEvent::Error { job_id, .. }
            | JobEvent::Complete { job_id, .. } => job_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::Started { .. } => "started",
            JobEvent::FileStart { .. } => "file-start",
            JobEvent::Progress { .. } => "progress",
            JobEvent::Skipped { .. } => "skipped",
            JobEvent::FileComplete { .. } => "file-complete",
            JobEvent::Error { .. } => "error",
            JobEvent::Complete { .. } => "complete",
        }
    }
}

/// Pub/sub channel injected into the pipelines. Cloning shares the same channel.
///
/// Slow subscribers that fall more than the channel capacity behind lose the
/// oldest events; publishing never blocks the pipeline.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: JobEvent) {
        debug!(job_id = event.job_id(), kind = event.kind(), ?event, "job event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Subscribe to the events of a single job.
    pub fn subscribe_job(&self, job_id: impl Into<String>) -> JobSubscription {
        JobSubscription {
            job_id: job_id.into(),
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug)]
pub struct JobSubscription {
    job_id: String,
    rx: broadcast::Receiver<JobEvent>,
}

impl JobSubscription {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Next event for this job. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.job_id() == self.job_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(job_id = %self.job_id, skipped, "event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drain whatever is buffered right now without waiting.
    pub fn drain(&mut self) -> Vec<JobEvent> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) if event.job_id() == self.job_id => out.push(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return out,
            }
        }
    }
}
