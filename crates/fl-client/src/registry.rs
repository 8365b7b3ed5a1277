//! Job registry
//!
//! The authoritative collection of job records, keyed by
//! (endpoint, job id). The message dispatcher is the only protocol-side
//! mutator; jobs leave the registry only through explicit user action,
//! never because a connection dropped.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, RwLock};

use fl_core::{JobKey, JobStatus};

/// Capacity of the change-notification channel. A slow subscriber
/// misses events rather than stalling the dispatcher.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One unit of submitted work and its tracked execution state
#[derive(Debug, Clone)]
pub struct Job {
    /// Registry key: owning endpoint address + daemon-assigned id
    pub key: JobKey,
    /// Current execution status
    pub status: JobStatus,
    /// Title of the flow this job runs
    pub title: String,
    /// Command line the daemon assembled
    pub command_line: String,
    /// Diagnostic text collected before execution
    pub issues: String,
    /// Accumulated output, append-only
    pub output: String,
    /// Hostname the job runs on, as reported by the daemon
    pub hostname: String,
    /// Start timestamp as reported by the daemon
    pub started_at: String,
    /// Finish timestamp; empty while the job is running
    pub finished_at: String,
}

/// Change notifications for registry subscribers
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A job record was created
    Added(JobKey),
    /// Output was appended to a job
    OutputAppended(JobKey),
    /// A job's status changed
    StatusChanged(JobKey, JobStatus),
    /// A job record was removed by user action
    Removed(JobKey),
}

/// Fields of a job description as received from the daemon
#[derive(Debug, Clone, Default)]
pub struct JobDescription {
    pub id: String,
    pub status: JobStatus,
    pub title: String,
    pub started_at: String,
    pub finished_at: String,
    pub hostname: String,
    pub issues: String,
    pub command_line: String,
    pub output: String,
}

/// The authoritative job collection
pub struct JobRegistry {
    jobs: DashMap<JobKey, Arc<RwLock<Job>>>,
    events: broadcast::Sender<JobEvent>,
}

impl JobRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            jobs: DashMap::new(),
            events,
        }
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Create a job record, or return the existing one.
    ///
    /// Idempotent per key: a second add for the same (endpoint, id)
    /// returns the record already present and emits no event.
    pub fn add(&self, endpoint: &str, desc: JobDescription) -> Arc<RwLock<Job>> {
        let key = JobKey::new(endpoint, desc.id.clone());
        match self.jobs.entry(key.clone()) {
            Entry::Occupied(existing) => Arc::clone(existing.get()),
            Entry::Vacant(slot) => {
                let job = Arc::new(RwLock::new(Job {
                    key: key.clone(),
                    status: desc.status,
                    title: desc.title,
                    command_line: desc.command_line,
                    issues: desc.issues,
                    output: desc.output,
                    hostname: desc.hostname,
                    started_at: desc.started_at,
                    finished_at: desc.finished_at,
                }));
                slot.insert(Arc::clone(&job));
                let _ = self.events.send(JobEvent::Added(key));
                job
            }
        }
    }

    /// Look up a job record
    pub fn find(&self, key: &JobKey) -> Option<Arc<RwLock<Job>>> {
        self.jobs.get(key).map(|r| Arc::clone(&r))
    }

    /// Append an output chunk to a job.
    ///
    /// Returns false when the key is unknown; the caller decides
    /// whether that is worth more than a debug log.
    pub async fn append_output(&self, key: &JobKey, chunk: &str) -> bool {
        let Some(job) = self.find(key) else {
            return false;
        };
        job.write().await.output.push_str(chunk);
        let _ = self.events.send(JobEvent::OutputAppended(key.clone()));
        true
    }

    /// Update a job's status and finish timestamp.
    pub async fn update_status(&self, key: &JobKey, status: JobStatus, finished_at: &str) -> bool {
        let Some(job) = self.find(key) else {
            return false;
        };
        {
            let mut job = job.write().await;
            job.status = status;
            job.finished_at = finished_at.to_string();
        }
        let _ = self.events.send(JobEvent::StatusChanged(key.clone(), status));
        true
    }

    /// Remove a job record. User action only.
    pub fn remove(&self, key: &JobKey) -> Option<Arc<RwLock<Job>>> {
        let removed = self.jobs.remove(key).map(|(_, job)| job);
        if removed.is_some() {
            let _ = self.events.send(JobEvent::Removed(key.clone()));
        }
        removed
    }

    /// All jobs belonging to one endpoint
    pub fn jobs_for(&self, endpoint: &str) -> Vec<Arc<RwLock<Job>>> {
        self.jobs
            .iter()
            .filter(|r| r.key().endpoint == endpoint)
            .map(|r| Arc::clone(&r))
            .collect()
    }

    /// Number of tracked jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
