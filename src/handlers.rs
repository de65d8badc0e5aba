use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::CameraConfig;
use crate::frame_cache::{FrameRegistry, StreamState};

const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

#[derive(Clone)]
pub struct PreviewState {
    registry: FrameRegistry,
    cameras: Arc<Vec<CameraConfig>>,
    frame_interval: Duration,
    shutdown: CancellationToken,
}

impl PreviewState {
    pub fn new(
        registry: FrameRegistry,
        cameras: Vec<CameraConfig>,
        frame_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            cameras: Arc::new(cameras),
            frame_interval,
            shutdown,
        }
    }
}

pub fn router(state: PreviewState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/video_feed", get(default_video_feed_handler))
        .route("/video_feed/:camera_id", get(video_feed_handler))
        .route("/status", get(status_handler))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

async fn index_handler(State(state): State<PreviewState>) -> Html<String> {
    trace!("Index page requested");
    let mut cards = String::new();
    for camera in state.cameras.iter() {
        let name = escape_html(&camera.name);
        if camera.enabled {
            let id = escape_html(&camera.id);
            cards.push_str(&format!(
                "<div class=\"camera\"><h2>{name}</h2><img src=\"/video_feed/{id}\" alt=\"{name}\"></div>\n"
            ));
        } else {
            cards.push_str(&format!(
                "<div class=\"camera disabled\"><h2>{name}</h2><p>Camera disabled</p></div>\n"
            ));
        }
    }

    Html(format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>Camera preview</title>\n\
         <style>body{{font-family:sans-serif;background:#111;color:#eee}}\
         .camera{{display:inline-block;margin:8px}}.camera img{{max-width:640px}}\
         .disabled{{opacity:.5}}</style>\n</head>\n<body>\n<h1>Camera preview</h1>\n{cards}</body>\n</html>\n"
    ))
}

async fn video_feed_handler(
    Path(camera_id): Path<String>,
    State(state): State<PreviewState>,
) -> Response {
    match state.registry.feed(&camera_id) {
        Some(_) => mjpeg_response(camera_id, &state),
        None => (StatusCode::NOT_FOUND, "Camera not found").into_response(),
    }
}

async fn default_video_feed_handler(State(state): State<PreviewState>) -> Response {
    match state.registry.first() {
        Some(feed) => mjpeg_response(feed.id.clone(), &state),
        None => (StatusCode::NOT_FOUND, "No cameras available").into_response(),
    }
}

fn mjpeg_response(camera_id: String, state: &PreviewState) -> Response {
    debug!(camera = %camera_id, "Preview client connected");
    let interval = state.frame_interval;
    let feed = (state.registry.clone(), camera_id, state.shutdown.clone());

    let parts = futures_util::stream::unfold(feed, move |(registry, camera_id, shutdown)| async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Some(frame) = registry.get_frame(&camera_id) {
                let part = multipart_frame(&frame.data);
                return Some((Ok::<_, Infallible>(part), (registry, camera_id, shutdown)));
            }
        }
    });

    ([(header::CONTENT_TYPE, MJPEG_CONTENT_TYPE)], Body::from_stream(parts)).into_response()
}

fn multipart_frame(jpeg: &[u8]) -> Bytes {
    let mut part = BytesMut::with_capacity(jpeg.len() + 48);
    part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}

#[derive(Serialize)]
struct StatusResponse {
    timestamp: DateTime<Local>,
    cameras: BTreeMap<String, CameraStatus>,
}

#[derive(Serialize)]
struct CameraStatus {
    name: String,
    connected: bool,
    state: StreamState,
    last_frame: Option<DateTime<Utc>>,
}

async fn status_handler(State(state): State<PreviewState>) -> Json<StatusResponse> {
    let cameras = state.registry
        .feeds()
        .iter()
        .map(|feed| {
            let stream_state = feed.cache.state();
            (feed.id.clone(), CameraStatus {
                name: feed.name.clone(),
                connected: stream_state == StreamState::Streaming,
                state: stream_state,
                last_frame: feed.cache.last_frame_time(),
            })
        })
        .collect();

    Json(StatusResponse { timestamp: Local::now(), cameras })
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
