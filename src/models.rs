use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Active,
    Completed,
}

/// Advisory progress for one job, fed by the websocket push-event listener.
/// Never gates completion decisions on its own.
#[derive(Debug, Clone, Default)]
pub struct JobProgress {
    pub current_step: u64,
    pub total_steps: u64,
    pub videos_generated: u64,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl JobProgress {
    pub fn percent(&self) -> f64 {
        if self.total_steps == 0 {
            0.0
        } else {
            (self.current_step as f64 / self.total_steps as f64) * 100.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: String,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: JobProgress,
}

/// Upload lifecycle for one output file, keyed by base name.
/// A key absent from the registry map has never been claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    InProgress,
    Uploaded,
    FailedPendingRetry,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentJob {
    pub job_id: String,
    pub completed_at: DateTime<Utc>,
    /// Set when the job hit the hard wall-clock window without a
    /// detectable completion signal.
    pub forced: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobProgressDetail {
    pub job_id: String,
    pub progress_percent: f64,
    pub current_step: u64,
    pub total_steps: u64,
    pub videos_generated: u64,
}

/// Read-only snapshot served by `GET /progress-status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub active_jobs: usize,
    pub completed_jobs: usize,
    pub uploaded_videos: usize,
    pub queue_pending: usize,
    pub queue_running: usize,
    pub overall_progress: f64,
    pub idle_seconds: f64,
    pub last_activity: DateTime<Utc>,
    pub recent_jobs: Vec<RecentJob>,
    pub job_details: Vec<JobProgressDetail>,
}

/// Pending/running entries from the engine's `GET /queue`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub queue_pending: Vec<Value>,
    #[serde(default)]
    pub queue_running: Vec<Value>,
}

impl QueueSnapshot {
    pub fn pending(&self) -> usize {
        self.queue_pending.len()
    }

    pub fn running(&self) -> usize {
        self.queue_running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue_pending.is_empty() && self.queue_running.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Image,
}

impl MediaKind {
    pub fn from_file_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".png")
            || lower.ends_with(".jpg")
            || lower.ends_with(".jpeg")
            || lower.ends_with(".gif")
            || lower.ends_with(".webp")
        {
            Self::Image
        } else {
            Self::Video
        }
    }
}

/// Success notification POSTed to `{backend}/api/modal-upload`.
#[derive(Debug, Clone, Serialize)]
pub struct UploadNotification {
    pub key: String,
    pub remote_url: String,
    pub filename: String,
    pub kind: MediaKind,
    pub source: String,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
}

/// Fallback notification POSTed to `{backend}/api/media/pending-upload`
/// when a file lands in the local fallback directory instead of storage.
#[derive(Debug, Clone, Serialize)]
pub struct PendingUploadNotification {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    pub filename: String,
    pub status: String,
}

impl PendingUploadNotification {
    pub fn new(path: String, filename: String) -> Self {
        Self {
            kind: "pending_upload".to_string(),
            path,
            filename,
            status: "pending_retry".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_percent_handles_zero_total() {
        let progress = JobProgress::default();
        assert_eq!(progress.percent(), 0.0);
    }

    #[test]
    fn media_kind_from_extension() {
        assert_eq!(MediaKind::from_file_name("shot.mp4"), MediaKind::Video);
        assert_eq!(MediaKind::from_file_name("frame.PNG"), MediaKind::Image);
        assert_eq!(MediaKind::from_file_name("no_extension"), MediaKind::Video);
    }

    #[test]
    fn queue_snapshot_counts() {
        let snapshot: QueueSnapshot =
            serde_json::from_str(r#"{"queue_pending": [[1]], "queue_running": []}"#).unwrap();
        assert_eq!(snapshot.pending(), 1);
        assert_eq!(snapshot.running(), 0);
        assert!(!snapshot.is_empty());
    }

    #[test]
    fn pending_notification_shape() {
        let payload = PendingUploadNotification::new("/fallback/a.mp4".into(), "a.mp4".into());
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "pending_upload");
        assert_eq!(json["status"], "pending_retry");
    }
}
