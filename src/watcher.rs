use std::{collections::HashSet, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::{fs, time};
use tracing::{info, warn};

use crate::{config::Config, engine::EngineClient, registry::JobRegistry, upload::Uploader};

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub poll_interval: Duration,
    /// Push-event silence taken to mean generation has finished.
    pub quiet_period: Duration,
    /// Wall-clock bound after which the job is force-completed.
    pub hard_timeout: Duration,
    /// Advisory percent at which completion no longer waits for quiet.
    pub near_complete_percent: f64,
}

impl WatcherConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval,
            quiet_period: config.progress_quiet_period,
            hard_timeout: config.job_hard_timeout,
            near_complete_percent: 95.0,
        }
    }
}

/// Decides when an active job is actually done. Deliberately conservative:
/// the engine's queue-drain signal can race the final file flush, so
/// completion requires an empty queue AND at least one new output file AND
/// either push-event silence or a near-complete advisory estimate.
#[derive(Clone)]
pub struct CompletionWatcher {
    registry: JobRegistry,
    engine: EngineClient,
    uploader: Arc<Uploader>,
    output_dir: PathBuf,
    config: WatcherConfig,
}

impl CompletionWatcher {
    pub fn new(
        registry: JobRegistry,
        engine: EngineClient,
        uploader: Arc<Uploader>,
        output_dir: PathBuf,
        config: WatcherConfig,
    ) -> Self {
        Self {
            registry,
            engine,
            uploader,
            output_dir,
            config,
        }
    }

    /// One supervised task per job, spawned at registration and retired at
    /// completion.
    pub fn spawn(&self, job_id: String) {
        let watcher = self.clone();
        tokio::spawn(async move {
            watcher.run(job_id).await;
        });
    }

    async fn run(self, job_id: String) {
        let watch_started = Utc::now();
        let started = time::Instant::now();
        let initial = match self.snapshot_outputs().await {
            Ok(files) => files,
            Err(err) => {
                warn!(job_id = %job_id, "Initial output scan failed, assuming empty: {err:#}");
                HashSet::new()
            }
        };
        info!(
            job_id = %job_id,
            baseline_files = initial.len(),
            "Completion watcher started"
        );

        let mut interval = time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            // A stuck engine must not pin the process active forever and
            // block idle shutdown.
            if started.elapsed() > self.config.hard_timeout {
                warn!(
                    job_id = %job_id,
                    timeout_s = self.config.hard_timeout.as_secs(),
                    "Hard timeout reached, force-completing job"
                );
                self.registry.force_complete(&job_id);
                return;
            }

            let current = match self.snapshot_outputs().await {
                Ok(files) => files,
                Err(err) => {
                    warn!(job_id = %job_id, "Output scan failed, retrying next tick: {err:#}");
                    continue;
                }
            };
            let new_files: Vec<&String> = current.difference(&initial).collect();

            // Dispatch newly observed files immediately; the claim guard
            // keeps concurrent detectors from double-uploading.
            for name in &new_files {
                if self.registry.claim_upload(name) {
                    info!(job_id = %job_id, file = %name, "New output file claimed for upload");
                    let uploader = Arc::clone(&self.uploader);
                    let path = self.output_dir.join(name.as_str());
                    tokio::spawn(async move {
                        uploader.deliver(&path).await;
                    });
                }
            }

            let queue = match self.engine.queue().await {
                Ok(queue) => queue,
                Err(err) => {
                    warn!(job_id = %job_id, "Queue poll failed, retrying next tick: {err:#}");
                    continue;
                }
            };

            let progress = self.registry.progress(&job_id).unwrap_or_default();
            let quiet_anchor = progress.last_event_at.unwrap_or(watch_started);
            let quiet = (Utc::now() - quiet_anchor)
                .to_std()
                .map(|d| d >= self.config.quiet_period)
                .unwrap_or(false);
            let near_complete = progress.percent() >= self.config.near_complete_percent;

            if queue.is_empty() && !new_files.is_empty() && (quiet || near_complete) {
                info!(
                    job_id = %job_id,
                    new_files = new_files.len(),
                    progress = progress.percent(),
                    "Completion declared: queue empty, outputs present, progress settled"
                );
                self.registry.complete(&job_id);
                return;
            }

            info!(
                job_id = %job_id,
                pending = queue.pending(),
                running = queue.running(),
                new_files = new_files.len(),
                progress = progress.percent(),
                "Watcher tick"
            );
        }
    }

    async fn snapshot_outputs(&self) -> Result<HashSet<String>> {
        let mut entries = fs::read_dir(&self.output_dir).await.with_context(|| {
            format!("Failed to read output dir {}", self.output_dir.display())
        })?;
        let mut files = HashSet::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_artifact(name) {
                    files.insert(name.to_string());
                }
            }
        }
        Ok(files)
    }
}

/// Engine outputs worth delivering; scratch and metadata files are not.
fn is_artifact(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    [".mp4", ".webm", ".png", ".jpg", ".jpeg", ".gif", ".webp"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}
