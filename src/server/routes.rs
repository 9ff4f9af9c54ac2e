//! Model management endpoints
//!
//! The authoritative route list of the distribution API, plus the
//! OpenAI-shaped model listing. References are normalized server-side;
//! pull and push responses stream newline-delimited progress events and
//! always end with a single terminal event.

use crate::distribution::PullOptions;
use crate::error::DistributionError;
use crate::progress::{self, ProgressEvent, ProgressSink};
use crate::reference::Reference;
use crate::server::AppState;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Create the model management router.
pub fn model_routes() -> Router<AppState> {
    Router::new()
        .route("/models", get(list_models))
        .route("/models/create", post(create_model))
        .route("/models/load", post(load_model))
        .route("/models/package", post(package_model))
        .route("/models/purge", delete(purge_models))
        .route("/models/du", get(disk_usage))
        .route(
            "/models/*name",
            get(get_model).delete(delete_model).post(model_action),
        )
        .route("/v1/models", get(openai_list_models))
        .route("/v1/models/*name", get(openai_get_model))
        .fallback(|| async { (StatusCode::NOT_FOUND, "not found") })
}

#[derive(Debug, Deserialize)]
struct ModelCreateRequest {
    from: String,
    #[serde(default)]
    ignore_runtime_memory_check: bool,
}

#[derive(Debug, Deserialize)]
struct ModelPackageRequest {
    from: String,
    tag: String,
    #[serde(default)]
    context_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GetModelQuery {
    #[serde(default)]
    remote: bool,
}

#[derive(Debug, Deserialize)]
struct DeleteModelQuery {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct TagQuery {
    #[serde(default)]
    repo: Option<String>,
    #[serde(default)]
    tag: Option<String>,
}

fn status_for(err: &DistributionError) -> StatusCode {
    match err {
        DistributionError::InvalidReference(_) | DistributionError::InvalidOperation(_) => {
            StatusCode::BAD_REQUEST
        }
        DistributionError::ModelNotFound(_) => StatusCode::NOT_FOUND,
        DistributionError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        DistributionError::Conflict(_) => StatusCode::CONFLICT,
        DistributionError::UnsupportedMediaType(_) | DistributionError::UnsupportedFormat => {
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        }
        DistributionError::InsufficientMemory { .. } => StatusCode::INSUFFICIENT_STORAGE,
        DistributionError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Map an error to a response: plain text unless the client negotiated
/// JSON. Cancellation is not an error worth logging.
fn error_response(err: &DistributionError, wants_json: bool) -> Response {
    if !err.is_cancelled() {
        warn!(error = %err, "request failed");
    }
    let status = status_for(err);
    if wants_json {
        (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
    } else {
        (status, err.to_string()).into_response()
    }
}

fn accepts_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "application/json")
        .unwrap_or(false)
}

/// Build the chunked streaming response carrying progress events.
fn stream_response(rx: mpsc::Receiver<ProgressEvent>, wants_json: bool) -> Response {
    let body = Body::from_stream(
        ReceiverStream::new(rx)
            .map(move |event| Ok::<Bytes, Infallible>(progress::encode_line(&event, wants_json))),
    );
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(if wants_json {
            "application/json"
        } else {
            "text/plain"
        }),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        header::TRANSFER_ENCODING,
        HeaderValue::from_static("chunked"),
    );
    response
}

/// POST /models/create: pull a model, streaming progress.
async fn create_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ModelCreateRequest>,
) -> Response {
    let wants_json = accepts_json(&headers);

    // Validate before the stream starts so parse and memory failures keep
    // their status codes.
    if let Err(err) = Reference::parse(&request.from, state.client.registry_settings()) {
        return error_response(&err, wants_json);
    }
    if !request.ignore_runtime_memory_check {
        if let Err(err) = state.client.verify_memory(&request.from).await {
            return error_response(&err, wants_json);
        }
    }

    let (tx, rx) = mpsc::channel(64);
    let sink = ProgressSink::new(tx, CancellationToken::new());
    let client = Arc::clone(&state.client);
    let from = request.from.clone();
    tokio::spawn(async move {
        let result = client
            .pull(
                &from,
                sink.clone(),
                PullOptions {
                    ignore_memory_check: true,
                },
            )
            .await;
        match result {
            Ok(canonical) => {
                sink.finish(ProgressEvent::Success {
                    message: format!("Model {canonical} pulled successfully"),
                })
                .await;
            }
            Err(err) if err.is_cancelled() => {
                info!(model = %from, "pull canceled by client");
            }
            Err(err) => {
                warn!(model = %from, error = %err, "pull failed");
                sink.finish(ProgressEvent::Error {
                    message: err.to_string(),
                })
                .await;
            }
        }
    });

    stream_response(rx, wants_json)
}

/// GET /models: list local models.
async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match state.client.list_models().await {
        Ok(models) => Json(models).into_response(),
        Err(err) => error_response(&err, accepts_json(&headers)),
    }
}

/// GET /models/{name...}?remote=bool: inspect a model.
async fn get_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<GetModelQuery>,
    headers: HeaderMap,
) -> Response {
    let result = if query.remote {
        state.client.get_remote_model(&name).await
    } else {
        state.client.get_model(&name).await
    };
    match result {
        Ok(model) => Json(model).into_response(),
        Err(err) => error_response(&err, accepts_json(&headers)),
    }
}

/// DELETE /models/{name...}?force=bool: remove a model.
async fn delete_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<DeleteModelQuery>,
    headers: HeaderMap,
) -> Response {
    match state.client.delete_model(&name, query.force).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_response(&err, accepts_json(&headers)),
    }
}

/// POST /models/{name...}: dispatch `tag` and `push` actions encoded as the
/// last path segment.
async fn model_action(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<TagQuery>,
    headers: HeaderMap,
) -> Response {
    let Some((model, action)) = name.rsplit_once('/') else {
        return (StatusCode::NOT_FOUND, format!("unknown action {name:?}")).into_response();
    };
    match action {
        "tag" => tag_model(state, model, query, &headers).await,
        "push" => push_model(state, model, &headers).await,
        other => (StatusCode::NOT_FOUND, format!("unknown action {other:?}")).into_response(),
    }
}

/// POST /models/{name}/tag?repo=&tag=
async fn tag_model(state: AppState, model: &str, query: TagQuery, headers: &HeaderMap) -> Response {
    let (Some(repo), Some(tag)) = (query.repo, query.tag) else {
        return (
            StatusCode::BAD_REQUEST,
            "missing repo or tag query parameter",
        )
            .into_response();
    };
    let target = format!("{repo}:{tag}");
    match state.client.tag(model, &target).await {
        Ok(applied) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "message": format!("Model tagged successfully with {applied:?}"),
                "target": applied,
            })),
        )
            .into_response(),
        Err(err) => error_response(&err, accepts_json(headers)),
    }
}

/// POST /models/{name}/push: push to the registry, streaming progress.
async fn push_model(state: AppState, model: &str, headers: &HeaderMap) -> Response {
    let wants_json = accepts_json(headers);

    let (tx, rx) = mpsc::channel(64);
    let sink = ProgressSink::new(tx, CancellationToken::new());
    let client = Arc::clone(&state.client);
    let model = model.to_string();
    tokio::spawn(async move {
        match client.push(&model, sink.clone()).await {
            Ok(()) => {
                sink.finish(ProgressEvent::Success {
                    message: format!("Model {model} pushed successfully"),
                })
                .await;
            }
            Err(err) if err.is_cancelled() => {
                info!(%model, "push canceled by client");
            }
            Err(err) => {
                warn!(%model, error = %err, "push failed");
                sink.finish(ProgressEvent::Error {
                    message: err.to_string(),
                })
                .await;
            }
        }
    });

    stream_response(rx, wants_json)
}

/// POST /models/package: lightweight repackage with a new config.
async fn package_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ModelPackageRequest>,
) -> Response {
    if request.from.is_empty() || request.tag.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "both 'from' and 'tag' fields are required",
        )
            .into_response();
    }
    match state
        .client
        .package(&request.from, &request.tag, request.context_size)
        .await
    {
        Ok(tag) => Json(serde_json::json!({
            "message": format!("Successfully packaged model from {} with tag {tag}", request.from),
            "model": tag,
        }))
        .into_response(),
        Err(err) => error_response(&err, accepts_json(&headers)),
    }
}

/// POST /models/load: install a model from a tar archive body.
async fn load_model(State(state): State<AppState>, headers: HeaderMap, body: Body) -> Response {
    let wants_json = accepts_json(&headers);

    let staging = match tempfile::tempdir() {
        Ok(staging) => staging,
        Err(err) => return error_response(&DistributionError::Io(err), wants_json),
    };
    let archive_path = staging.path().join("model.tar");

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err)));
    let mut reader = tokio_util::io::StreamReader::new(stream);
    let result = async {
        let mut file = tokio::fs::File::create(&archive_path).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        Ok::<_, std::io::Error>(())
    }
    .await;
    if let Err(err) = result {
        return error_response(&DistributionError::Io(err), wants_json);
    }

    match state.client.load_model(&archive_path).await {
        Ok(model) => Json(model).into_response(),
        Err(err) => error_response(&err, wants_json),
    }
}

/// DELETE /models/purge: drop all manifests, tags, and blobs.
async fn purge_models(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match state.client.purge().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(&err, accepts_json(&headers)),
    }
}

/// GET /models/du: total store size in bytes.
async fn disk_usage(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match state.client.disk_usage() {
        Ok(size) => Json(serde_json::json!({ "models_disk_usage": size })).into_response(),
        Err(err) => error_response(&err, accepts_json(&headers)),
    }
}

#[derive(Debug, Serialize)]
struct OpenAiModel {
    id: String,
    object: &'static str,
    created: i64,
    owned_by: &'static str,
}

#[derive(Debug, Serialize)]
struct OpenAiModelList {
    object: &'static str,
    data: Vec<OpenAiModel>,
}

fn to_openai(model: &crate::store::ModelInfo) -> OpenAiModel {
    OpenAiModel {
        id: model
            .tags
            .first()
            .cloned()
            .unwrap_or_else(|| model.id.clone()),
        object: "model",
        created: model.created,
        owned_by: "modelstream",
    }
}

/// GET /v1/models: OpenAI-shaped model listing.
async fn openai_list_models(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match state.client.list_models().await {
        Ok(models) => Json(OpenAiModelList {
            object: "list",
            data: models.iter().map(to_openai).collect(),
        })
        .into_response(),
        Err(err) => error_response(&err, accepts_json(&headers)),
    }
}

/// GET /v1/models/{name...}: OpenAI-shaped single model.
async fn openai_get_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    match state.client.get_model(&name).await {
        Ok(model) => Json(to_openai(&model)).into_response(),
        Err(err) => error_response(&err, accepts_json(&headers)),
    }
}
