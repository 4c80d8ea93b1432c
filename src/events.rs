use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{engine::EngineClient, registry::JobRegistry};

const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Long-lived listener on the engine's websocket channel. Progress and
/// node-execution events refine the registry's advisory percent-complete
/// estimates; they never gate completion by themselves, so a dead channel
/// simply leaves the watcher on pure polling.
///
/// Events carry no job attribution, so they are applied to every active
/// job. That only gives job-level precision in single-job-at-a-time
/// deployments, which is the expected operating mode.
pub fn spawn_event_listener(registry: JobRegistry, engine: EngineClient) {
    tokio::spawn(async move {
        let url = engine.ws_url();
        loop {
            match connect_async(url.as_str()).await {
                Ok((mut stream, _)) => {
                    info!(url = %url, "Push-event channel connected");
                    while let Some(message) = stream.next().await {
                        match message {
                            Ok(Message::Text(text)) => handle_event(&registry, text.as_str()),
                            Ok(_) => {}
                            Err(err) => {
                                warn!("Push-event channel read failed: {err}");
                                break;
                            }
                        }
                    }
                    warn!("Push-event channel closed, falling back to polling");
                }
                Err(err) => {
                    warn!(url = %url, "Push-event channel connect failed: {err}");
                }
            }
            sleep(RECONNECT_DELAY).await;
        }
    });
}

fn handle_event(registry: &JobRegistry, raw: &str) {
    let Ok(event) = serde_json::from_str::<Value>(raw) else {
        debug!("Ignoring non-JSON push event");
        return;
    };
    let data = event.get("data").unwrap_or(&Value::Null);

    match event.get("type").and_then(|t| t.as_str()) {
        Some("progress") => {
            let current = data.get("value").and_then(|v| v.as_u64()).unwrap_or(0);
            let total = data.get("max").and_then(|v| v.as_u64()).unwrap_or(0);
            for job_id in registry.active_job_ids() {
                registry.record_progress(&job_id, current, total);
            }
        }
        Some("executing") => {
            if let Some(node) = data.get("node").and_then(|n| n.as_str()) {
                debug!(node = %node, "Engine executing node");
            }
        }
        Some("executed") => {
            let produced_media = data
                .get("output")
                .map(|output| output.get("videos").is_some() || output.get("images").is_some())
                .unwrap_or(false);
            if produced_media {
                for job_id in registry.active_job_ids() {
                    registry.record_output_event(&job_id);
                }
            }
        }
        _ => {}
    }
}
