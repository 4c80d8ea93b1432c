use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{engine::EngineResponse, upload::content_type_for, AppState};

pub async fn root() -> impl IntoResponse {
    Json(json!({ "ok": true, "msg": "ComfyUI proxy up. Try /health or /progress-status." }))
}

pub async fn health(State(state): State<AppState>) -> Response {
    proxy_result(state.engine.system_stats().await)
}

pub async fn system_stats(State(state): State<AppState>) -> Response {
    proxy_result(state.engine.system_stats().await)
}

pub async fn queue(State(state): State<AppState>) -> Response {
    proxy_result(state.engine.queue_raw().await)
}

pub async fn object_info(State(state): State<AppState>) -> Response {
    proxy_result(state.engine.object_info().await)
}

pub async fn history_all(State(state): State<AppState>) -> Response {
    proxy_result(state.engine.history_all().await)
}

pub async fn history(State(state): State<AppState>, Path(prompt_id): Path<String>) -> Response {
    proxy_result(state.engine.history(&prompt_id).await)
}

#[derive(Debug, Deserialize)]
pub struct ViewParams {
    filename: String,
}

/// Serve a generated file straight from the output directory.
pub async fn view(State(state): State<AppState>, Query(params): Query<ViewParams>) -> Response {
    let name = params.filename;
    // The filename must be a bare base name inside the output directory.
    if name.is_empty() || name.contains("..") || name.contains('/') || name.contains('\\') {
        return error_json(StatusCode::BAD_REQUEST, json!({ "error": "invalid filename" }));
    }
    let path = state.config.output_dir.join(&name);
    match tokio::fs::read(&path).await {
        Ok(content) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type_for(&name))
            .body(Body::from(content))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => error_json(
            StatusCode::NOT_FOUND,
            json!({ "error": format!("File {name} not found") }),
        ),
        Err(err) => error_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": format!("Error reading file: {err}") }),
        ),
    }
}

/// Read-only status surface for operators and the polling frontend.
/// Registry reads only; never blocks on an in-flight upload.
pub async fn progress_status(State(state): State<AppState>) -> impl IntoResponse {
    let queue = state.engine.queue().await.unwrap_or_default();
    Json(state.registry.status(&queue))
}

/// Accept a workflow graph, register it for completion tracking, and
/// forward it to the engine. Tolerates clients that double-encode the
/// prompt (or individual nodes) as JSON strings.
pub async fn submit_prompt(State(state): State<AppState>, body: Bytes) -> Response {
    let Ok(mut request) = serde_json::from_slice::<Value>(&body) else {
        return error_json(StatusCode::BAD_REQUEST, json!({ "error": "Invalid JSON body" }));
    };

    let job_id = request
        .get("client_id")
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("job_{}", Utc::now().timestamp()));

    let Some(prompt) = request.get("prompt") else {
        return error_json(
            StatusCode::BAD_REQUEST,
            json!({ "error": "Missing 'prompt' in body" }),
        );
    };

    // Revive a top-level string-encoded prompt.
    let mut revived_top = false;
    if let Some(raw) = prompt.as_str() {
        match serde_json::from_str::<Value>(raw) {
            Ok(parsed) if parsed.is_object() => {
                request["prompt"] = parsed;
                revived_top = true;
            }
            Ok(_) => {
                return error_json(
                    StatusCode::BAD_REQUEST,
                    json!({ "error": "prompt string did not parse to an object" }),
                );
            }
            Err(err) => {
                return error_json(
                    StatusCode::BAD_REQUEST,
                    json!({ "error": format!("prompt string not valid JSON: {err}") }),
                );
            }
        }
    }

    let Some(prompt_map) = request
        .get_mut("prompt")
        .and_then(|p| p.as_object_mut())
    else {
        return error_json(
            StatusCode::BAD_REQUEST,
            json!({ "error": "prompt must be an object map" }),
        );
    };

    // Revive node-level strings, then validate node shapes.
    let mut revived_nodes = Vec::new();
    let mut bad_nodes = Vec::new();
    let mut missing_fields = Vec::new();
    for (key, value) in prompt_map.iter_mut() {
        if let Some(raw) = value.as_str() {
            match serde_json::from_str::<Value>(raw) {
                Ok(parsed) if parsed.is_object() => {
                    *value = parsed;
                    revived_nodes.push(key.clone());
                }
                _ => bad_nodes.push(key.clone()),
            }
        }
    }
    for (key, value) in prompt_map.iter() {
        match value.as_object() {
            Some(node) => {
                let has_inputs = node.get("inputs").map(Value::is_object).unwrap_or(false);
                if !node.contains_key("class_type") || !has_inputs {
                    missing_fields.push(key.clone());
                }
            }
            None => {
                if !bad_nodes.contains(key) {
                    bad_nodes.push(key.clone());
                }
            }
        }
    }

    if revived_top || !revived_nodes.is_empty() {
        info!(revived_top, revived_nodes = ?revived_nodes, "Revived string-encoded prompt data");
    }
    if !bad_nodes.is_empty() || !missing_fields.is_empty() {
        bad_nodes.truncate(20);
        missing_fields.truncate(20);
        return error_json(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "prompt contains invalid nodes",
                "string_nodes_unparsed": bad_nodes,
                "nodes_missing_fields": missing_fields,
            }),
        );
    }

    state.registry.register(&job_id);

    match state.engine.submit_prompt(&request).await {
        Ok(response) => {
            if response.status == 200 {
                state.watcher.spawn(job_id);
            } else {
                warn!(
                    job_id = %job_id,
                    status = response.status,
                    "Engine rejected prompt, completing job immediately"
                );
                state.registry.complete(&job_id);
            }
            engine_response(response)
        }
        Err(err) => {
            warn!(job_id = %job_id, "Prompt forwarding failed: {err:#}");
            state.registry.complete(&job_id);
            error_json(
                StatusCode::BAD_GATEWAY,
                json!({ "error": format!("engine unreachable: {err}") }),
            )
        }
    }
}

fn proxy_result(result: anyhow::Result<EngineResponse>) -> Response {
    match result {
        Ok(response) => engine_response(response),
        Err(err) => error_json(
            StatusCode::BAD_GATEWAY,
            json!({ "error": format!("engine unreachable: {err}") }),
        ),
    }
}

fn engine_response(response: EngineResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, response.content_type)
        .body(Body::from(response.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn error_json(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}
