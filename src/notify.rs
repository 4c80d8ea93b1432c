use std::{sync::OnceLock, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};

use crate::models::{PendingUploadNotification, UploadNotification};

/// Downstream backend notifications. Best-effort by contract: a failed
/// notification is logged and never undoes a recorded upload.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_uploaded(&self, payload: &UploadNotification) -> Result<()>;
    async fn notify_pending(&self, payload: &PendingUploadNotification) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct HttpNotifier {
    backend_url: String,
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(backend_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build backend notifier client")?;
        Ok(Self {
            backend_url: backend_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify_uploaded(&self, payload: &UploadNotification) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/modal-upload", self.backend_url))
            .json(payload)
            .send()
            .await
            .context("Backend upload notification failed")?;
        if response.status().is_success() {
            info!(
                filename = %payload.filename,
                project_id = ?payload.project_id,
                user_id = ?payload.user_id,
                "Backend notified of uploaded media"
            );
            Ok(())
        } else {
            anyhow::bail!(
                "Backend upload notification returned {}",
                response.status()
            );
        }
    }

    async fn notify_pending(&self, payload: &PendingUploadNotification) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/media/pending-upload", self.backend_url))
            .json(payload)
            .send()
            .await
            .context("Backend pending-upload notification failed")?;
        if response.status().is_success() {
            info!(filename = %payload.filename, "Backend notified of pending upload");
            Ok(())
        } else {
            anyhow::bail!(
                "Backend pending-upload notification returned {}",
                response.status()
            );
        }
    }
}

/// Fire a success notification without letting a backend hiccup surface
/// into the upload outcome.
pub async fn notify_uploaded_best_effort(notifier: &dyn Notifier, payload: &UploadNotification) {
    if let Err(err) = notifier.notify_uploaded(payload).await {
        warn!(filename = %payload.filename, "Upload notification failed: {err:#}");
    }
}

pub async fn notify_pending_best_effort(
    notifier: &dyn Notifier,
    payload: &PendingUploadNotification,
) {
    if let Err(err) = notifier.notify_pending(payload).await {
        warn!(filename = %payload.filename, "Pending-upload notification failed: {err:#}");
    }
}

/// Extract `(user_id, project_id)` from the structured output file naming
/// convention `u{user}_p{project}_...`.
pub fn extract_ids_from_filename(filename: &str) -> (Option<String>, Option<String>) {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"ua?([a-f0-9\-]+)_p([a-f0-9\-]+)_").expect("valid id pattern"));
    match pattern.captures(filename) {
        Some(captures) => (
            Some(captures[1].to_string()),
            Some(captures[2].to_string()),
        ),
        None => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_user_and_project_tokens() {
        let (user, project) =
            extract_ids_from_filename("u1a2b3c_pdeadbeef-0001_shot_00001.mp4");
        assert_eq!(user.as_deref(), Some("1a2b3c"));
        assert_eq!(project.as_deref(), Some("deadbeef-0001"));
    }

    #[test]
    fn tolerates_legacy_ua_prefix() {
        let (user, project) = extract_ids_from_filename("uaffee_p1234_clip.mp4");
        assert_eq!(user.as_deref(), Some("ffee"));
        assert_eq!(project.as_deref(), Some("1234"));
    }

    #[test]
    fn unstructured_names_yield_nothing() {
        let (user, project) = extract_ids_from_filename("ComfyUI_00042.mp4");
        assert_eq!(user, None);
        assert_eq!(project, None);
    }
}
