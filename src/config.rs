use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Result;

/// Runtime configuration, read once at startup. Every tunable has a
/// documented default so the proxy runs with nothing but storage
/// credentials configured.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Base URL of the local generation engine (ComfyUI).
    pub engine_url: String,
    /// Directory the engine writes finished artifacts into.
    pub output_dir: PathBuf,
    /// Durable local directory for uploads that exhausted every strategy.
    pub fallback_dir: PathBuf,

    pub storage: StorageConfig,

    /// Downstream backend notified about finished uploads.
    pub backend_url: String,

    /// Files below this size are considered still-flushing garbage.
    pub min_artifact_bytes: u64,
    /// File size must hold constant this long before upload begins.
    pub stable_window: Duration,
    /// Upper bound on the stabilization wait; timing out proceeds anyway.
    pub max_stabilization_wait: Duration,

    /// Completion watcher poll interval.
    pub poll_interval: Duration,
    /// Push-event silence taken to mean generation has finished.
    pub progress_quiet_period: Duration,
    /// Hard wall-clock window after which a job is force-completed.
    pub job_hard_timeout: Duration,

    /// Idle monitor check interval.
    pub idle_check_interval: Duration,
    /// Quiet period with zero active jobs before teardown is considered.
    pub idle_shutdown_after: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    /// Custom S3-compatible endpoint; empty means AWS proper.
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
}

impl StorageConfig {
    pub fn is_configured(&self) -> bool {
        !self.bucket.is_empty() && !self.access_key.is_empty() && !self.secret_key.is_empty()
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("COMFY_RELAY_BIND_ADDR")
            .ok()
            .and_then(|v| v.trim().parse::<SocketAddr>().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let engine_url = env::var("COMFY_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8188".to_string())
            .trim_end_matches('/')
            .to_string();

        let output_dir =
            PathBuf::from(env::var("COMFY_OUTPUT_DIR").unwrap_or_else(|_| "/outputs".to_string()));

        let fallback_dir = PathBuf::from(
            env::var("PENDING_UPLOAD_DIR")
                .unwrap_or_else(|_| "/modal_volumes/pending_uploads".to_string()),
        );

        let storage = StorageConfig {
            bucket: env::var("S3_BUCKET").unwrap_or_default(),
            region: env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            endpoint: env::var("S3_ENDPOINT").ok().filter(|v| !v.trim().is_empty()),
            access_key: env::var("AWS_ACCESS_KEY_ID").unwrap_or_default(),
            secret_key: env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
        };

        let backend_url = env::var("BACKEND_URL")
            .unwrap_or_else(|_| "http://localhost:3001".to_string())
            .trim_end_matches('/')
            .to_string();

        let min_artifact_bytes = env::var("MIN_VIDEO_BYTES")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(4096);

        let stable_window = secs_f64_env("UPLOAD_STABLE_WINDOW_S", 2.0);
        let max_stabilization_wait = secs_f64_env("UPLOAD_MAX_WAIT_S", 300.0);

        let poll_interval = secs_env("WATCHER_POLL_INTERVAL_S", 5);
        let progress_quiet_period = secs_env("PROGRESS_QUIET_PERIOD_S", 30);
        let job_hard_timeout = secs_env("JOB_HARD_TIMEOUT_S", 600);

        let idle_check_interval = secs_env("IDLE_CHECK_INTERVAL_S", 15);
        let idle_shutdown_after = secs_env("IDLE_SHUTDOWN_AFTER_S", 20);

        Ok(Self {
            bind_addr,
            engine_url,
            output_dir,
            fallback_dir,
            storage,
            backend_url,
            min_artifact_bytes,
            stable_window,
            max_stabilization_wait,
            poll_interval,
            progress_quiet_period,
            job_hard_timeout,
            idle_check_interval,
            idle_shutdown_after,
        })
    }
}

fn secs_env(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        env::var(name)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(default),
    )
}

fn secs_f64_env(name: &str, default: f64) -> Duration {
    let secs = env::var(name)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(default);
    Duration::from_secs_f64(secs)
}
