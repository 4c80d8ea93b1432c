use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use tokio::{
    fs,
    io::AsyncReadExt,
    time::{sleep, Instant},
};
use tracing::{error, info, warn};

use crate::{
    config::Config,
    models::{MediaKind, PendingUploadNotification, UploadNotification},
    notify::{
        extract_ids_from_filename, notify_pending_best_effort, notify_uploaded_best_effort,
        Notifier,
    },
    registry::JobRegistry,
    storage::{ObjectStore, StorageError},
};

const REMOTE_KEY_PREFIX: &str = "modal-generated";

/// Upload strategies in escalation order. Each is a fallback for the
/// previous one's failure; the first success wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    SingleShot,
    Multipart,
    Chunked,
    LocalFallback,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// False when storage credentials are absent; strategies 1-3 are
    /// skipped and files go straight to the local fallback.
    pub storage_enabled: bool,
    pub min_artifact_bytes: u64,
    pub stable_window: Duration,
    pub max_stabilization_wait: Duration,
    pub stabilization_poll: Duration,
    pub single_shot_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub part_size: usize,
    pub part_attempts: u32,
    pub part_retry_delay: Duration,
    pub chunk_size: usize,
    pub deferred_retry_delay: Duration,
    pub deferred_retry_attempts: u32,
    pub deferred_retry_interval: Duration,
}

impl UploadConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            storage_enabled: config.storage.is_configured(),
            min_artifact_bytes: config.min_artifact_bytes,
            stable_window: config.stable_window,
            max_stabilization_wait: config.max_stabilization_wait,
            ..Self::default()
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            storage_enabled: true,
            min_artifact_bytes: 4096,
            stable_window: Duration::from_secs(2),
            max_stabilization_wait: Duration::from_secs(300),
            stabilization_poll: Duration::from_millis(250),
            single_shot_attempts: 5,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            part_size: 50 * 1024 * 1024,
            part_attempts: 3,
            part_retry_delay: Duration::from_secs(2),
            chunk_size: 10 * 1024 * 1024,
            deferred_retry_delay: Duration::from_secs(60),
            deferred_retry_attempts: 3,
            deferred_retry_interval: Duration::from_secs(120),
        }
    }
}

/// Moves one local artifact to durable object storage and reports where it
/// landed. Callers must hold the registry's upload claim for the file's
/// base name before invoking [`Uploader::deliver`].
#[derive(Clone)]
pub struct Uploader {
    registry: JobRegistry,
    store: Arc<dyn ObjectStore>,
    notifier: Arc<dyn Notifier>,
    config: UploadConfig,
    fallback_dir: PathBuf,
}

impl Uploader {
    pub fn new(
        registry: JobRegistry,
        store: Arc<dyn ObjectStore>,
        notifier: Arc<dyn Notifier>,
        config: UploadConfig,
        fallback_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            store,
            notifier,
            config,
            fallback_dir,
        }
    }

    /// Run the full strategy escalation for one file. Returns true only on
    /// a verified upload; a fallback-queued file returns false but remains
    /// safe on disk with a deferred retry scheduled. `release_upload` is
    /// called with the outcome on every path.
    pub async fn deliver(&self, path: &Path) -> bool {
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => {
                error!(path = %path.display(), "Upload skipped: path has no file name");
                return false;
            }
        };

        if fs::metadata(path).await.is_err() {
            error!(path = %path.display(), "Upload aborted: file missing or unreadable");
            self.registry.release_upload(&file_name, false);
            return false;
        }

        self.wait_for_stable_size(path).await;

        let size = match fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(err) => {
                error!(path = %path.display(), "Upload aborted: stat failed: {err}");
                self.registry.release_upload(&file_name, false);
                return false;
            }
        };
        info!(
            file = %file_name,
            size_mb = size as f64 / (1024.0 * 1024.0),
            "Starting upload delivery"
        );

        if let Some(key) = self.run_strategies(path, &file_name, size).await {
            self.notify_success(&key, &file_name).await;
            self.registry.release_upload(&file_name, true);
            return true;
        }

        // Every storage strategy exhausted: queue locally for one deferred
        // retry pass, never silently drop the file.
        match self.store_in_fallback(path, &file_name).await {
            Ok(fallback_path) => {
                let payload = PendingUploadNotification::new(
                    fallback_path.display().to_string(),
                    file_name.clone(),
                );
                notify_pending_best_effort(self.notifier.as_ref(), &payload).await;
                self.registry.release_upload(&file_name, false);
                self.schedule_deferred_retry(fallback_path, file_name, size);
            }
            Err(err) => {
                error!(file = %file_name, "Fallback storage failed: {err:#}");
                self.registry.release_upload(&file_name, false);
            }
        }
        false
    }

    async fn run_strategies(&self, path: &Path, file_name: &str, size: u64) -> Option<String> {
        if !self.config.storage_enabled {
            warn!(file = %file_name, "Storage credentials not configured, using local fallback");
            return None;
        }
        for strategy in [
            UploadStrategy::SingleShot,
            UploadStrategy::Multipart,
            UploadStrategy::Chunked,
        ] {
            let result = match strategy {
                UploadStrategy::SingleShot => self.single_shot(path, file_name, size).await,
                UploadStrategy::Multipart => {
                    self.multipart(path, file_name, size, self.config.part_size)
                        .await
                }
                UploadStrategy::Chunked => self.chunked(path, file_name, size).await,
                UploadStrategy::LocalFallback => unreachable!("handled by deliver"),
            };
            match result {
                Some(key) => {
                    info!(file = %file_name, ?strategy, key = %key, "Upload strategy succeeded");
                    return Some(key);
                }
                None => warn!(file = %file_name, ?strategy, "Upload strategy failed, escalating"),
            }
        }
        None
    }

    /// One PUT of the whole file, retried with exponential backoff and
    /// jitter on transient errors. The file is read once and the buffer
    /// reused across attempts. A verification mismatch deletes the bad
    /// remote object before the next attempt.
    async fn single_shot(&self, path: &Path, file_name: &str, size: u64) -> Option<String> {
        let body = match fs::read(path).await {
            Ok(body) => body,
            Err(err) => {
                error!(file = %file_name, "Read failed, aborting single-shot: {err}");
                return None;
            }
        };

        for attempt in 0..self.config.single_shot_attempts {
            let key = remote_key(file_name);
            match self
                .store
                .put_object(&key, body.clone(), content_type_for(file_name))
                .await
            {
                Ok(()) => {
                    if self.verify_remote(&key, size).await {
                        return Some(key);
                    }
                    if let Err(err) = self.store.delete_object(&key).await {
                        warn!(key = %key, "Failed deleting unverified object: {err}");
                    }
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        file = %file_name,
                        attempt = attempt + 1,
                        max = self.config.single_shot_attempts,
                        "Single-shot attempt failed: {err}"
                    );
                    if attempt + 1 < self.config.single_shot_attempts {
                        sleep(self.backoff_delay(attempt)).await;
                    }
                }
                Err(err) => {
                    error!(file = %file_name, "Single-shot hit permanent error: {err}");
                    return None;
                }
            }
        }
        None
    }

    /// Fixed-size parts with per-part retries; the session is explicitly
    /// aborted when a part permanently fails so no dangling incomplete
    /// upload is left behind.
    async fn multipart(
        &self,
        path: &Path,
        file_name: &str,
        size: u64,
        part_size: usize,
    ) -> Option<String> {
        let key = remote_key(file_name);
        let upload_id = match self
            .store
            .create_multipart(&key, content_type_for(file_name))
            .await
        {
            Ok(id) => id,
            Err(err) => {
                warn!(file = %file_name, "Failed to initiate multipart upload: {err}");
                return None;
            }
        };

        match self
            .upload_parts(path, file_name, &key, &upload_id, part_size)
            .await
        {
            Ok(parts) => {
                if let Err(err) = self.store.complete_multipart(&key, &upload_id, &parts).await {
                    warn!(file = %file_name, "Multipart completion failed: {err}");
                    let _ = self.store.abort_multipart(&key, &upload_id).await;
                    return None;
                }
            }
            Err(err) => {
                warn!(file = %file_name, "Multipart part upload failed: {err:#}");
                if let Err(abort_err) = self.store.abort_multipart(&key, &upload_id).await {
                    warn!(key = %key, "Multipart abort failed: {abort_err}");
                }
                return None;
            }
        }

        if self.verify_remote(&key, size).await {
            Some(key)
        } else {
            if let Err(err) = self.store.delete_object(&key).await {
                warn!(key = %key, "Failed deleting unverified multipart object: {err}");
            }
            None
        }
    }

    async fn upload_parts(
        &self,
        path: &Path,
        file_name: &str,
        key: &str,
        upload_id: &str,
        part_size: usize,
    ) -> Result<Vec<(u32, String)>> {
        let mut file = fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open {} for multipart read", path.display()))?;
        let mut parts = Vec::new();
        let mut part_number: u32 = 1;

        loop {
            let mut buf = Vec::with_capacity(part_size);
            let read = (&mut file)
                .take(part_size as u64)
                .read_to_end(&mut buf)
                .await
                .with_context(|| format!("Failed reading part {part_number}"))?;
            if read == 0 {
                break;
            }

            let mut uploaded = false;
            for attempt in 0..self.config.part_attempts {
                match self
                    .store
                    .upload_part(key, upload_id, part_number, buf.clone())
                    .await
                {
                    Ok(etag) => {
                        parts.push((part_number, etag));
                        uploaded = true;
                        break;
                    }
                    Err(err) => {
                        warn!(
                            file = %file_name,
                            part = part_number,
                            attempt = attempt + 1,
                            "Part upload failed: {err}"
                        );
                        if attempt + 1 < self.config.part_attempts {
                            sleep(self.config.part_retry_delay).await;
                        }
                    }
                }
            }
            if !uploaded {
                anyhow::bail!("part {part_number} exhausted its retries");
            }
            part_number += 1;
        }
        Ok(parts)
    }

    /// Smaller parts for flakier links. At or below the chunk size this
    /// degenerates to a plain upload; otherwise it defers to the multipart
    /// machinery with chunk-sized parts.
    async fn chunked(&self, path: &Path, file_name: &str, size: u64) -> Option<String> {
        if size as usize > self.config.chunk_size {
            return self
                .multipart(path, file_name, size, self.config.chunk_size)
                .await;
        }

        let key = remote_key(file_name);
        let body = match fs::read(path).await {
            Ok(body) => body,
            Err(err) => {
                error!(file = %file_name, "Read failed in chunked upload: {err}");
                return None;
            }
        };
        match self
            .store
            .put_object(&key, body, content_type_for(file_name))
            .await
        {
            Ok(()) => {
                if self.verify_remote(&key, size).await {
                    Some(key)
                } else {
                    if let Err(err) = self.store.delete_object(&key).await {
                        warn!(key = %key, "Failed deleting unverified object: {err}");
                    }
                    None
                }
            }
            Err(err) => {
                warn!(file = %file_name, "Chunked upload failed: {err}");
                None
            }
        }
    }

    /// Confirm the remote object's size matches what was read locally and
    /// clears the minimum floor. A mismatch is an attempt failure, never a
    /// success.
    async fn verify_remote(&self, key: &str, expected: u64) -> bool {
        match self.store.head_object_size(key).await {
            Ok(actual) if actual < self.config.min_artifact_bytes => {
                warn!(
                    key = %key,
                    actual,
                    floor = self.config.min_artifact_bytes,
                    "Verification failed: object below minimum size"
                );
                false
            }
            Ok(actual) if actual != expected => {
                warn!(key = %key, expected, actual, "Verification failed: size mismatch");
                false
            }
            Ok(actual) => {
                info!(key = %key, bytes = actual, "Upload verified");
                true
            }
            Err(err) => {
                warn!(key = %key, "Verification request failed: {err}");
                false
            }
        }
    }

    /// Poll the file size until it holds constant for the stable window and
    /// clears the minimum floor, bounded by the maximum wait. Timing out
    /// proceeds with whatever size is observed.
    async fn wait_for_stable_size(&self, path: &Path) {
        let started = Instant::now();
        let mut last_size: Option<u64> = None;
        let mut stable_since = Instant::now();

        loop {
            let size = fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
            let now = Instant::now();
            if last_size != Some(size) {
                last_size = Some(size);
                stable_since = now;
            }
            if size >= self.config.min_artifact_bytes
                && now.duration_since(stable_since) >= self.config.stable_window
            {
                return;
            }
            if now.duration_since(started) > self.config.max_stabilization_wait {
                warn!(
                    path = %path.display(),
                    size,
                    waited_s = started.elapsed().as_secs_f64(),
                    "File never stabilized, proceeding anyway"
                );
                return;
            }
            sleep(self.config.stabilization_poll).await;
        }
    }

    async fn notify_success(&self, key: &str, file_name: &str) {
        let (user_id, project_id) = extract_ids_from_filename(file_name);
        let payload = UploadNotification {
            key: key.to_string(),
            remote_url: self.store.public_url(key),
            filename: file_name.to_string(),
            kind: MediaKind::from_file_name(file_name),
            source: "modal_generated".to_string(),
            project_id,
            user_id,
        };
        notify_uploaded_best_effort(self.notifier.as_ref(), &payload).await;
    }

    async fn store_in_fallback(&self, path: &Path, file_name: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.fallback_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create fallback directory {}",
                    self.fallback_dir.display()
                )
            })?;
        let fallback_path = self
            .fallback_dir
            .join(format!("{}_{file_name}", Utc::now().timestamp()));
        fs::copy(path, &fallback_path).await.with_context(|| {
            format!("Failed to copy {} into fallback store", path.display())
        })?;
        info!(
            file = %file_name,
            fallback = %fallback_path.display(),
            "Stored artifact in local fallback"
        );
        Ok(fallback_path)
    }

    /// Exactly one deferred retry pass per failed file: a fixed delay, then
    /// a bounded number of single-shot attempts from the fallback copy. If
    /// the pass never succeeds the copy stays put for manual recovery.
    fn schedule_deferred_retry(&self, fallback_path: PathBuf, file_name: String, size: u64) {
        let uploader = self.clone();
        tokio::spawn(async move {
            sleep(uploader.config.deferred_retry_delay).await;
            if !uploader.registry.reclaim_for_retry(&file_name) {
                return;
            }

            for attempt in 0..uploader.config.deferred_retry_attempts {
                info!(
                    file = %file_name,
                    attempt = attempt + 1,
                    max = uploader.config.deferred_retry_attempts,
                    "Deferred retry attempt"
                );
                if let Some(key) = uploader.single_shot(&fallback_path, &file_name, size).await {
                    uploader.notify_success(&key, &file_name).await;
                    uploader.registry.release_upload(&file_name, true);
                    if let Err(err) = fs::remove_file(&fallback_path).await {
                        warn!(
                            fallback = %fallback_path.display(),
                            "Failed removing fallback copy after retry success: {err}"
                        );
                    }
                    return;
                }
                if attempt + 1 < uploader.config.deferred_retry_attempts {
                    sleep(uploader.config.deferred_retry_interval).await;
                }
            }

            warn!(
                file = %file_name,
                fallback = %fallback_path.display(),
                "Deferred retry pass exhausted; fallback copy kept for manual recovery"
            );
            uploader.registry.release_upload(&file_name, false);
        });
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp = self
            .config
            .backoff_base
            .checked_mul(multiplier)
            .unwrap_or(self.config.backoff_cap)
            .min(self.config.backoff_cap);
        let jitter = rand::thread_rng().gen_range(0..1000u64);
        (exp + Duration::from_millis(jitter)).min(self.config.backoff_cap)
    }
}

pub fn remote_key(file_name: &str) -> String {
    format!("{REMOTE_KEY_PREFIX}/{}_{file_name}", Utc::now().timestamp())
}

pub(crate) fn content_type_for(file_name: &str) -> &'static str {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".mp4") {
        "video/mp4"
    } else if lower.ends_with(".webm") {
        "video/webm"
    } else if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else {
        "application/octet-stream"
    }
}
