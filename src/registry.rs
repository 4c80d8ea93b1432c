use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::models::{
    JobProgress, JobProgressDetail, JobRecord, JobState, QueueSnapshot, RecentJob, StatusResponse,
    UploadState,
};

/// Completed jobs retained for the status surface.
const RECENT_HISTORY_LIMIT: usize = 32;

/// In-memory job and upload bookkeeping shared by the watcher tasks, the
/// upload pipeline, and the idle monitor.
///
/// All mutations go through short critical sections on a single mutex, so
/// the active-job count is always consistent with the job map and the
/// status read path never waits on an in-flight upload.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    jobs: HashMap<String, JobRecord>,
    uploads: HashMap<String, UploadState>,
    recent: VecDeque<RecentJob>,
    completed_count: usize,
    last_activity: chrono::DateTime<Utc>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                jobs: HashMap::new(),
                uploads: HashMap::new(),
                recent: VecDeque::new(),
                completed_count: 0,
                last_activity: Utc::now(),
            })),
        }
    }

    /// Record a newly accepted job as active. Duplicate ids overwrite the
    /// prior entry; ids are caller-derived and expected to be unique.
    pub fn register(&self, job_id: &str) {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        if inner.jobs.contains_key(job_id) {
            warn!(job_id = %job_id, "Duplicate job id, replacing prior entry");
        }
        inner.jobs.insert(
            job_id.to_string(),
            JobRecord {
                job_id: job_id.to_string(),
                state: JobState::Active,
                started_at: now,
                completed_at: None,
                progress: JobProgress::default(),
            },
        );
        inner.last_activity = now;
        info!(job_id = %job_id, active = inner.active_count(), "Job registered");
    }

    /// Transition a job to completed. Returns false when the job was
    /// unknown or already completed, so the transition fires exactly once.
    pub fn complete(&self, job_id: &str) -> bool {
        self.complete_inner(job_id, false)
    }

    /// Completion forced by the hard wall-clock timeout rather than a
    /// detected signal.
    pub fn force_complete(&self, job_id: &str) -> bool {
        self.complete_inner(job_id, true)
    }

    fn complete_inner(&self, job_id: &str, forced: bool) -> bool {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let Some(job) = inner.jobs.get_mut(job_id) else {
            warn!(job_id = %job_id, "Completion for unknown job ignored");
            return false;
        };
        if job.state == JobState::Completed {
            return false;
        }
        job.state = JobState::Completed;
        job.completed_at = Some(now);

        inner.completed_count += 1;
        inner.recent.push_back(RecentJob {
            job_id: job_id.to_string(),
            completed_at: now,
            forced,
        });
        while inner.recent.len() > RECENT_HISTORY_LIMIT {
            inner.recent.pop_front();
        }
        inner.last_activity = now;
        info!(job_id = %job_id, forced, active = inner.active_count(), "Job completed");
        true
    }

    /// Atomically reserve the right to upload `key`. Exactly one caller
    /// wins for a given key, regardless of whether the websocket detector
    /// or the filesystem scan got there first.
    pub fn claim_upload(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.uploads.contains_key(key) {
            return false;
        }
        inner.uploads.insert(key.to_string(), UploadState::InProgress);
        true
    }

    /// Record the outcome of an upload attempt. `Uploaded` is terminal and
    /// never downgraded.
    pub fn release_upload(&self, key: &str, success: bool) {
        let mut inner = self.inner.lock();
        match inner.uploads.get(key) {
            Some(UploadState::Uploaded) => {}
            _ => {
                let state = if success {
                    UploadState::Uploaded
                } else {
                    UploadState::FailedPendingRetry
                };
                inner.uploads.insert(key.to_string(), state);
            }
        }
    }

    /// Move a failed upload back in flight for its single scheduled retry
    /// pass. Only `FailedPendingRetry` entries are eligible.
    pub fn reclaim_for_retry(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.uploads.get(key) {
            Some(UploadState::FailedPendingRetry) => {
                inner.uploads.insert(key.to_string(), UploadState::InProgress);
                true
            }
            _ => false,
        }
    }

    pub fn upload_state(&self, key: &str) -> Option<UploadState> {
        self.inner.lock().uploads.get(key).copied()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active_count()
    }

    pub fn active_job_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .jobs
            .values()
            .filter(|j| j.state == JobState::Active)
            .map(|j| j.job_id.clone())
            .collect()
    }

    pub fn job_state(&self, job_id: &str) -> Option<JobState> {
        self.inner.lock().jobs.get(job_id).map(|j| j.state)
    }

    /// Wall-clock time since the last registration or completion.
    pub fn idle_duration(&self) -> Duration {
        let last = self.inner.lock().last_activity;
        (Utc::now() - last).to_std().unwrap_or(Duration::ZERO)
    }

    /// Advisory step progress from the engine's push channel.
    pub fn record_progress(&self, job_id: &str, current_step: u64, total_steps: u64) {
        let mut inner = self.inner.lock();
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.progress.current_step = current_step;
            job.progress.total_steps = total_steps;
            job.progress.last_event_at = Some(Utc::now());
        }
    }

    /// A node-executed push event that produced an output.
    pub fn record_output_event(&self, job_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.progress.videos_generated += 1;
            job.progress.last_event_at = Some(Utc::now());
        }
    }

    pub fn progress(&self, job_id: &str) -> Option<JobProgress> {
        self.inner.lock().jobs.get(job_id).map(|j| j.progress.clone())
    }

    /// Snapshot for the status endpoint. Pure reads, no I/O.
    pub fn status(&self, queue: &QueueSnapshot) -> StatusResponse {
        let inner = self.inner.lock();
        let mut job_details = Vec::new();
        let mut progress_sum = 0.0;
        for job in inner.jobs.values().filter(|j| j.state == JobState::Active) {
            let percent = job.progress.percent();
            progress_sum += percent;
            job_details.push(JobProgressDetail {
                job_id: job.job_id.clone(),
                progress_percent: percent,
                current_step: job.progress.current_step,
                total_steps: job.progress.total_steps,
                videos_generated: job.progress.videos_generated,
            });
        }
        let active = job_details.len();
        let overall_progress = if active == 0 {
            100.0
        } else {
            progress_sum / active as f64
        };
        let uploaded_videos = inner
            .uploads
            .values()
            .filter(|s| **s == UploadState::Uploaded)
            .count();

        StatusResponse {
            active_jobs: active,
            completed_jobs: inner.completed_count,
            uploaded_videos,
            queue_pending: queue.pending(),
            queue_running: queue.running(),
            overall_progress,
            idle_seconds: (Utc::now() - inner.last_activity)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .as_secs_f64(),
            last_activity: inner.last_activity,
            recent_jobs: inner.recent.iter().cloned().collect(),
            job_details,
        }
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn active_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| j.state == JobState::Active)
            .count()
    }
}
