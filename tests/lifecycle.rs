//! Job lifecycle against a stub engine server: completion detection, the
//! hard-timeout safety net, the idle-shutdown gate, and prompt intake.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{routing::get, routing::post, Json, Router};
use comfy_relay::{
    config::Config,
    engine::EngineClient,
    models::{JobState, MediaKind, PendingUploadNotification, UploadNotification, UploadState},
    notify::Notifier,
    registry::JobRegistry,
    shutdown::IdleMonitor,
    storage::{ObjectStore, StorageError},
    upload::{UploadConfig, Uploader},
    watcher::{CompletionWatcher, WatcherConfig},
    AppState,
};
use parking_lot::Mutex;
use serde_json::json;

/// Minimal engine stand-in: `/queue` reflects a shared flag, `/prompt`
/// always accepts.
async fn spawn_stub_engine(queue_empty: Arc<AtomicBool>) -> String {
    let app = Router::new()
        .route(
            "/queue",
            get({
                let queue_empty = Arc::clone(&queue_empty);
                move || {
                    let queue_empty = Arc::clone(&queue_empty);
                    async move {
                        if queue_empty.load(Ordering::SeqCst) {
                            Json(json!({ "queue_pending": [], "queue_running": [] }))
                        } else {
                            Json(json!({ "queue_pending": [[0, "p1"]], "queue_running": [] }))
                        }
                    }
                }
            }),
        )
        .route(
            "/prompt",
            post(|| async { Json(json!({ "prompt_id": "p1", "number": 1 })) }),
        )
        .route(
            "/object_info",
            get(|| async { Json(json!({ "KSampler": { "input": {} } })) }),
        )
        .route(
            "/history",
            get(|| async { Json(json!({ "p1": { "status": "success" } })) }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Store that accepts everything and verifies sizes honestly.
#[derive(Default)]
struct AcceptingStore {
    puts: Mutex<Vec<(String, u64)>>,
}

#[async_trait]
impl ObjectStore for AcceptingStore {
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), StorageError> {
        self.puts.lock().push((key.to_string(), body.len() as u64));
        Ok(())
    }

    async fn head_object_size(&self, key: &str) -> Result<u64, StorageError> {
        self.puts
            .lock()
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, size)| *size)
            .ok_or(StorageError::NotFound)
    }

    async fn delete_object(&self, _key: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn create_multipart(
        &self,
        _key: &str,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        Err(StorageError::Transport("multipart unused here".into()))
    }

    async fn upload_part(
        &self,
        _key: &str,
        _upload_id: &str,
        _part_number: u32,
        _body: Vec<u8>,
    ) -> Result<String, StorageError> {
        Err(StorageError::Transport("multipart unused here".into()))
    }

    async fn complete_multipart(
        &self,
        _key: &str,
        _upload_id: &str,
        _parts: &[(u32, String)],
    ) -> Result<(), StorageError> {
        Err(StorageError::Transport("multipart unused here".into()))
    }

    async fn abort_multipart(&self, _key: &str, _upload_id: &str) -> Result<(), StorageError> {
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("https://cdn.example/{key}")
    }
}

#[derive(Default)]
struct RecordingNotifier {
    uploaded: Mutex<Vec<UploadNotification>>,
    pending: Mutex<Vec<PendingUploadNotification>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_uploaded(&self, payload: &UploadNotification) -> anyhow::Result<()> {
        self.uploaded.lock().push(payload.clone());
        Ok(())
    }

    async fn notify_pending(&self, payload: &PendingUploadNotification) -> anyhow::Result<()> {
        self.pending.lock().push(payload.clone());
        Ok(())
    }
}

fn fast_upload_config() -> UploadConfig {
    UploadConfig {
        min_artifact_bytes: 16,
        stable_window: Duration::from_millis(20),
        max_stabilization_wait: Duration::from_millis(500),
        stabilization_poll: Duration::from_millis(5),
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(5),
        ..UploadConfig::default()
    }
}

struct Rig {
    registry: JobRegistry,
    engine: EngineClient,
    watcher: CompletionWatcher,
    store: Arc<AcceptingStore>,
    notifier: Arc<RecordingNotifier>,
    queue_empty: Arc<AtomicBool>,
    output_dir: PathBuf,
    _dir: tempfile::TempDir,
}

async fn rig(watcher_config: WatcherConfig) -> Rig {
    let queue_empty = Arc::new(AtomicBool::new(false));
    let engine_url = spawn_stub_engine(Arc::clone(&queue_empty)).await;

    let dir = tempfile::tempdir().unwrap();
    let output_dir = dir.path().join("outputs");
    let fallback_dir = dir.path().join("fallback");
    std::fs::create_dir_all(&output_dir).unwrap();

    let registry = JobRegistry::new();
    let engine = EngineClient::new(&engine_url).unwrap();
    let store = Arc::new(AcceptingStore::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let uploader = Arc::new(Uploader::new(
        registry.clone(),
        Arc::clone(&store) as Arc<dyn ObjectStore>,
        Arc::clone(&notifier) as Arc<dyn Notifier>,
        fast_upload_config(),
        fallback_dir,
    ));
    let watcher = CompletionWatcher::new(
        registry.clone(),
        engine.clone(),
        uploader,
        output_dir.clone(),
        watcher_config,
    );

    Rig {
        registry,
        engine,
        watcher,
        store,
        notifier,
        queue_empty,
        output_dir,
        _dir: dir,
    }
}

fn fast_watcher_config() -> WatcherConfig {
    WatcherConfig {
        poll_interval: Duration::from_millis(20),
        quiet_period: Duration::from_millis(50),
        hard_timeout: Duration::from_secs(10),
        near_complete_percent: 95.0,
    }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn new_output_is_uploaded_and_job_completes_when_queue_drains() {
    let r = rig(fast_watcher_config()).await;
    r.registry.register("job-1");
    r.watcher.spawn("job-1".to_string());

    // Let the watcher take its baseline snapshot before the file appears.
    tokio::time::sleep(Duration::from_millis(40)).await;
    std::fs::write(r.output_dir.join("out.mp4"), vec![0u8; 6 * 1024]).unwrap();
    r.queue_empty.store(true, Ordering::SeqCst);

    wait_until("upload to land", || {
        r.registry.upload_state("out.mp4") == Some(UploadState::Uploaded)
    })
    .await;
    wait_until("job completion", || r.registry.active_count() == 0).await;

    // One claim, one put, one success notification, no fallback traffic.
    assert_eq!(r.store.puts.lock().len(), 1);
    let uploaded = r.notifier.uploaded.lock();
    assert_eq!(uploaded.len(), 1);
    assert_eq!(uploaded[0].filename, "out.mp4");
    assert_eq!(uploaded[0].kind, MediaKind::Video);
    drop(uploaded);
    assert!(r.notifier.pending.lock().is_empty());

    let status = r.registry.status(&Default::default());
    assert_eq!(status.completed_jobs, 1);
    assert!(!status.recent_jobs[0].forced);
}

#[tokio::test]
async fn empty_queue_without_new_outputs_does_not_complete() {
    let r = rig(fast_watcher_config()).await;
    r.queue_empty.store(true, Ordering::SeqCst);
    r.registry.register("job-1");
    r.watcher.spawn("job-1".to_string());

    // Several poll cycles with an empty queue but no outputs.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(r.registry.active_count(), 1);
    assert!(r.store.puts.lock().is_empty());
}

#[tokio::test]
async fn hard_timeout_force_completes_a_stuck_job() {
    let config = WatcherConfig {
        hard_timeout: Duration::from_millis(100),
        ..fast_watcher_config()
    };
    let r = rig(config).await;
    // Queue never drains and nothing is ever written.
    r.registry.register("job-1");
    r.watcher.spawn("job-1".to_string());

    wait_until("forced completion", || r.registry.active_count() == 0).await;

    let status = r.registry.status(&Default::default());
    assert_eq!(status.completed_jobs, 1);
    assert!(status.recent_jobs[0].forced);
    assert!(r.store.puts.lock().is_empty());
    assert!(r.notifier.uploaded.lock().is_empty());
}

#[tokio::test]
async fn pre_existing_outputs_are_not_reuploaded() {
    let r = rig(fast_watcher_config()).await;
    std::fs::write(r.output_dir.join("old.mp4"), vec![0u8; 6 * 1024]).unwrap();

    r.registry.register("job-1");
    r.watcher.spawn("job-1".to_string());
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(r.store.puts.lock().is_empty());
    assert_eq!(r.registry.upload_state("old.mp4"), None);
}

#[tokio::test]
async fn idle_gate_requires_all_three_conditions() {
    let r = rig(fast_watcher_config()).await;
    let monitor = IdleMonitor::new(
        r.registry.clone(),
        r.engine.clone(),
        Duration::from_millis(20),
        Duration::from_millis(50),
    );

    // Active job: never terminate, however long the queue looks empty.
    r.queue_empty.store(true, Ordering::SeqCst);
    r.registry.register("job-1");
    assert!(!monitor.should_terminate().await);

    // Completed but within the quiet period.
    r.registry.complete("job-1");
    assert!(!monitor.should_terminate().await);

    // Quiet period elapsed but the engine still reports queued work.
    r.queue_empty.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!monitor.should_terminate().await);

    // All three quiet at once.
    r.queue_empty.store(true, Ordering::SeqCst);
    assert!(monitor.should_terminate().await);
}

#[tokio::test]
async fn idle_monitor_fires_terminate_once_quiet() {
    let r = rig(fast_watcher_config()).await;
    r.queue_empty.store(true, Ordering::SeqCst);

    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    IdleMonitor::new(
        r.registry.clone(),
        r.engine.clone(),
        Duration::from_millis(20),
        Duration::from_millis(50),
    )
    .with_terminate(Arc::new(move || flag.store(true, Ordering::SeqCst)))
    .spawn();

    wait_until("terminate hook", || fired.load(Ordering::SeqCst)).await;
}

#[tokio::test]
async fn prompt_intake_registers_job_and_revives_string_prompts() {
    let r = rig(fast_watcher_config()).await;
    let state = AppState {
        config: Config::from_env().unwrap(),
        registry: r.registry.clone(),
        engine: r.engine.clone(),
        watcher: r.watcher.clone(),
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = comfy_relay::router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::new();

    // A prompt double-encoded as a JSON string is revived and accepted.
    let graph = json!({ "3": { "class_type": "KSampler", "inputs": { "steps": 20 } } });
    let body = json!({ "client_id": "job-abc", "prompt": graph.to_string() });
    let response = client
        .post(format!("http://{addr}/prompt"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(r.registry.job_state("job-abc"), Some(JobState::Active));

    // A node missing class_type is rejected before registration.
    let bad = json!({ "client_id": "job-bad", "prompt": { "3": { "inputs": {} } } });
    let response = client
        .post(format!("http://{addr}/prompt"))
        .json(&bad)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    assert_eq!(r.registry.job_state("job-bad"), None);

    // The status surface reflects the accepted job.
    let status: serde_json::Value = client
        .get(format!("http://{addr}/progress-status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["active_jobs"], 1);
}

#[tokio::test]
async fn proxy_forwards_engine_endpoints_and_serves_outputs() {
    let r = rig(fast_watcher_config()).await;
    let mut config = Config::from_env().unwrap();
    config.output_dir = r.output_dir.clone();
    let state = AppState {
        config,
        registry: r.registry.clone(),
        engine: r.engine.clone(),
        watcher: r.watcher.clone(),
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = comfy_relay::router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::new();

    let object_info: serde_json::Value = client
        .get(format!("http://{addr}/object_info"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(object_info.get("KSampler").is_some());

    let history: serde_json::Value = client
        .get(format!("http://{addr}/history"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(history.get("p1").is_some());

    // /view serves bytes straight from the output directory.
    let payload = vec![7u8; 128];
    std::fs::write(r.output_dir.join("out.mp4"), &payload).unwrap();
    let response = client
        .get(format!("http://{addr}/view"))
        .query(&[("filename", "out.mp4")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "video/mp4"
    );
    assert_eq!(response.bytes().await.unwrap().as_ref(), payload.as_slice());

    let missing = client
        .get(format!("http://{addr}/view"))
        .query(&[("filename", "nope.mp4")])
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status().as_u16(), 404);

    let traversal = client
        .get(format!("http://{addr}/view"))
        .query(&[("filename", "../etc/passwd")])
        .send()
        .await
        .unwrap();
    assert_eq!(traversal.status().as_u16(), 400);
}

#[tokio::test]
async fn unreachable_engine_blocks_idle_shutdown() {
    let registry = JobRegistry::new();
    // Nothing listens here; the queue probe fails and the probe failure
    // must read as "not empty".
    let engine = EngineClient::new("http://127.0.0.1:1").unwrap();
    let monitor = IdleMonitor::new(
        registry.clone(),
        engine,
        Duration::from_millis(20),
        Duration::from_millis(10),
    );
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!monitor.should_terminate().await);
}
