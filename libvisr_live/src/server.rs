//! HTTP and websocket front end.
//!
//! Control routes map onto [`PipelineCoordinator`] operations; `/ws/colors` registers a
//! subscriber with the hub and streams every broadcast to the client.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use super::config::Config;
use super::coordinator::{DatasetRequest, PipelineCoordinator, RunStateView, SessionOpened};
use super::error::{ServerError, SessionError};
use super::hub::{Payload, SubscriberHub};
use super::normalizer::NormalizedFraction;
use super::source::SourceOpener;
use super::stomp::run_queue_listener;
use super::watcher::{FilesystemService, FilesystemWatcher, QueueWatcher, TickTrigger, WatchTarget};
use super::worker::WorkerHandle;

/// Shared state of every handler
#[derive(Debug, Clone)]
pub struct AppState {
    pub coordinator: Arc<PipelineCoordinator>,
    pub queue_depth: usize,
}

/// A handler failure, rendered as `{"detail": ...}`
#[derive(Debug)]
pub enum ApiError {
    Session(SessionError),
    Internal(String),
}

impl From<SessionError> for ApiError {
    fn from(value: SessionError) -> Self {
        Self::Session(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::Session(e) => {
                let status = match e {
                    SessionError::DatasetNotFound(_) | SessionError::DatasetUninitialized => {
                        StatusCode::NOT_FOUND
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
            Self::Internal(detail) => (StatusCode::INTERNAL_SERVER_ERROR, detail),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

/// Coordinator calls may touch the disk, so they run on the blocking pool
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, SessionError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("Request task failed: {e}")))?
        .map_err(ApiError::from)
}

#[derive(Debug, Serialize)]
struct ShapeResponse {
    shape: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct ReadQuery {
    latest_n_reads: usize,
}

#[derive(Debug, Serialize)]
struct ReadResponse {
    data: Vec<NormalizedFraction>,
}

#[derive(Debug, Serialize)]
struct GroupsResponse {
    groups: Vec<String>,
}

async fn set_dataset(
    State(state): State<AppState>,
    Query(request): Query<DatasetRequest>,
) -> Result<Json<SessionOpened>, ApiError> {
    let coordinator = state.coordinator.clone();
    let opened = blocking(move || coordinator.open_session(request)).await?;
    Ok(Json(opened))
}

async fn get_dataset_shape(State(state): State<AppState>) -> Result<Json<ShapeResponse>, ApiError> {
    let coordinator = state.coordinator.clone();
    let shape = blocking(move || coordinator.shape()).await?;
    Ok(Json(ShapeResponse { shape }))
}

async fn read_dataset(
    State(state): State<AppState>,
    Query(query): Query<ReadQuery>,
) -> Result<Json<ReadResponse>, ApiError> {
    let coordinator = state.coordinator.clone();
    let n = query.latest_n_reads;
    let data = blocking(move || coordinator.latest_fractions(n)).await?;
    Ok(Json(ReadResponse { data }))
}

async fn get_state(State(state): State<AppState>) -> Result<Json<RunStateView>, ApiError> {
    let coordinator = state.coordinator.clone();
    let view = blocking(move || Ok(coordinator.state())).await?;
    Ok(Json(view))
}

async fn get_groups(State(state): State<AppState>) -> Result<Json<GroupsResponse>, ApiError> {
    let coordinator = state.coordinator.clone();
    let groups = blocking(move || coordinator.groups()).await?;
    Ok(Json(GroupsResponse { groups }))
}

async fn reset(State(state): State<AppState>) -> Result<Json<SessionOpened>, ApiError> {
    let coordinator = state.coordinator.clone();
    let opened = blocking(move || coordinator.reset_session()).await?;
    Ok(Json(opened))
}

async fn ws_colors(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_subscriber(socket, state))
}

/// Forward hub broadcasts to one websocket until either side goes away.
///
/// Inbound messages only keep the connection alive. When the hub prunes this subscriber
/// its sender is dropped, the channel closes and so does the socket.
async fn serve_subscriber(socket: WebSocket, state: AppState) {
    let hub: Arc<SubscriberHub> = state.coordinator.hub().clone();
    let (tx, mut rx) = mpsc::channel::<Payload>(state.queue_depth);
    let id = hub.add(Arc::new(tx));
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            payload = rx.recv() => match payload {
                Some(payload) => {
                    if let Err(e) = sink.send(Message::Text(payload.to_string().into())).await {
                        log::debug!("Subscriber {id} send failed: {e}");
                        break;
                    }
                }
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => (),
            },
        }
    }
    hub.remove(id);
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/set_dataset", post(set_dataset))
        .route("/set_dataset/", post(set_dataset))
        .route("/get_dataset_shape", get(get_dataset_shape))
        .route("/get_dataset_shape/", get(get_dataset_shape))
        .route("/read_dataset", get(read_dataset))
        .route("/read_dataset/", get(read_dataset))
        .route("/state", get(get_state))
        .route("/groups", get(get_groups))
        .route("/reset", post(reset))
        .route("/ws/colors", get(ws_colors))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Could not listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown requested");
}

/// Open the configured default dataset and queue a tick to catch up on frames written
/// before the server started. Returns true if the catch-up tick was queued.
async fn open_default(
    coordinator: Arc<PipelineCoordinator>,
    tx: &std::sync::mpsc::Sender<TickTrigger>,
) -> bool {
    match tokio::task::spawn_blocking(move || coordinator.open_session(DatasetRequest::default()))
        .await
    {
        Ok(Ok(opened)) => {
            log::info!("Opened default dataset with shape {:?}", opened.shape);
            if tx.send(TickTrigger::Tick).is_err() {
                log::debug!("Tick worker is gone; skipping the catch-up tick");
                return false;
            }
            true
        }
        Ok(Err(e)) => {
            log::warn!("Could not open default dataset: {e}");
            false
        }
        Err(e) => {
            log::error!("Opening task failed: {e}");
            false
        }
    }
}

/// Run the whole pipeline: tick worker, change notifiers and the HTTP server, until ctrl-c
pub async fn run_server(config: Config, opener: Arc<dyn SourceOpener>) -> Result<(), ServerError> {
    config.validate()?;
    let target = WatchTarget::new();
    let coordinator = Arc::new(PipelineCoordinator::new(
        opener,
        config.dataset_defaults(),
        Arc::new(SubscriberHub::new()),
        target.clone(),
    ));

    let (tx, rx) = std::sync::mpsc::channel::<TickTrigger>();
    let worker = WorkerHandle::spawn(coordinator.clone(), rx)?;

    let _filesystem = if config.notifier.uses_filesystem() {
        match FilesystemService::start(
            config.watch_directory(),
            FilesystemWatcher::new(target.clone()),
            tx.clone(),
        ) {
            Ok(service) => Some(service),
            Err(e) => {
                log::error!("File notifications are disabled: {e}");
                None
            }
        }
    } else {
        None
    };

    let queue = if config.notifier.uses_queue() {
        log::info!(
            "Listening for stream documents on {} at {}",
            config.stomp_destination,
            config.stomp_address
        );
        Some(tokio::spawn(run_queue_listener(
            config.queue_settings(),
            QueueWatcher::new(target.clone()),
            tx.clone(),
        )))
    } else {
        None
    };

    if config.open_on_start {
        open_default(coordinator.clone(), &tx).await;
    }
    drop(tx);

    let address = config.socket_address()?;
    let listener = TcpListener::bind(address).await?;
    log::info!("Serving on http://{address}");
    let state = AppState {
        coordinator,
        queue_depth: config.subscriber_queue_depth,
    };
    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Some(queue) = queue {
        queue.abort();
    }
    match tokio::task::spawn_blocking(move || worker.shutdown()).await {
        Ok(status) => log::info!(
            "Tick worker processed {} frames in {} ticks ({} failures)",
            status.frames,
            status.ticks,
            status.failures
        ),
        Err(e) => log::error!("Failed to join tick worker: {e}"),
    }
    Ok(served?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::DatasetDefaults;
    use crate::source::{MemoryDataset, MemoryOpener};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use std::path::{Path, PathBuf};
    use tower::ServiceExt;

    fn app() -> (MemoryDataset, Arc<PipelineCoordinator>, Router) {
        let dataset = MemoryDataset::new(&[9, 4]);
        let opener = MemoryOpener::new();
        opener
            .insert(
                Path::new("/beamline/data/0.hdf"),
                "entry/instrument/detector/data",
                dataset.clone(),
            )
            .unwrap();
        let coordinator = Arc::new(PipelineCoordinator::new(
            Arc::new(opener),
            DatasetDefaults {
                filepath: PathBuf::from("/beamline/data"),
                filename: String::from("0.hdf"),
                dataset_name: String::from("entry/instrument/detector/data"),
            },
            Arc::new(SubscriberHub::new()),
            WatchTarget::new(),
        ));
        let router = router(AppState {
            coordinator: coordinator.clone(),
            queue_depth: 8,
        });
        (dataset, coordinator, router)
    }

    async fn call(router: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn set_dataset_reports_shape() {
        let (dataset, _coordinator, router) = app();
        dataset.append_filled(1).unwrap();

        let (status, body) = call(&router, "POST", "/set_dataset?filename=0.hdf").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Dataset set successfully");
        assert_eq!(body["shape"], json!([1, 9, 4]));

        dataset.append_filled(2).unwrap();
        let (status, body) = call(&router, "GET", "/get_dataset_shape").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["shape"], json!([2, 9, 4]));
    }

    #[tokio::test]
    async fn unknown_dataset_is_not_found() {
        let (_dataset, _coordinator, router) = app();
        let (status, body) = call(&router, "POST", "/set_dataset/?dataset_name=entry/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["detail"].as_str().unwrap().contains("entry/nope"));

        let (status, _) = call(&router, "POST", "/set_dataset?filename=missing.hdf").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn reads_before_open_are_not_found() {
        let (_dataset, _coordinator, router) = app();
        let (status, body) = call(&router, "GET", "/get_dataset_shape/").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["detail"].is_string());
        let (status, _) = call(&router, "GET", "/read_dataset?latest_n_reads=3").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&router, "POST", "/reset").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&router, "GET", "/state").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "idle");
        assert_eq!(body["filename"], "0.hdf");
    }

    #[tokio::test]
    async fn read_dataset_returns_latest_fractions() {
        let (dataset, coordinator, router) = app();
        call(&router, "POST", "/set_dataset").await;
        for value in [0, 4, 2] {
            dataset.append_filled(value).unwrap();
        }
        coordinator.tick().unwrap();

        let (status, body) = call(&router, "GET", "/read_dataset?latest_n_reads=2").await;
        assert_eq!(status, StatusCode::OK);
        let data = body["data"].as_array().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0]["total"], 1.0);
        assert_eq!(data[1]["total"], 0.5);

        let (_, state) = call(&router, "GET", "/state").await;
        assert_eq!(state["cursor_position"], 3);
        assert_eq!(state["accumulated_stats"].as_array().unwrap().len(), 3);

        let (status, reset) = call(&router, "POST", "/reset").await;
        assert_eq!(status, StatusCode::OK);
        assert!(reset["session_id"].as_u64().unwrap() > state["session_id"].as_u64().unwrap());
        let (_, body) = call(&router, "GET", "/read_dataset?latest_n_reads=5").await;
        assert!(body["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn groups_lists_top_level_names() {
        let (_dataset, _coordinator, router) = app();
        let (status, body) = call(&router, "GET", "/groups").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["groups"], json!(["entry"]));
    }

    #[tokio::test]
    async fn cors_allows_any_origin() {
        let (_dataset, _coordinator, router) = app();
        let request = Request::builder()
            .uri("/state")
            .header("origin", "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "*"
        );
    }

    #[tokio::test]
    async fn default_open_survives_a_stopped_worker() {
        let (_dataset, coordinator, _router) = app();
        let (tx, rx) = std::sync::mpsc::channel();
        assert!(open_default(coordinator.clone(), &tx).await);
        assert_eq!(rx.try_recv().unwrap(), TickTrigger::Tick);

        drop(rx);
        assert!(!open_default(coordinator.clone(), &tx).await);
        assert!(coordinator.state().session_id.is_some());
    }
}
