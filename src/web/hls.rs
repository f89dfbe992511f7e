use crate::diagnostics::DiagnosticLog;
use crate::engine::Engine;
use crate::error::ApiError;
use crate::output::{is_segment_name, OutputDir, PLAYLIST_NAME};
use crate::state::{AppState, SharedState, StreamSlot};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::io::ReaderStream;
use tracing::info;
use url::Url;

const ENSURE_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// 进程退出后等待 stderr 读完的上限
const EXIT_SETTLE_POLLS: u32 = 10;
const EXIT_SETTLE_INTERVAL: Duration = Duration::from_millis(20);

enum StartupOutcome {
    Ready,
    Exited {
        exit_code: Option<i32>,
        last_error: Option<String>,
    },
    TimedOut,
}

/// Starts (or reuses) the camera's transcoder and waits, bounded by the
/// startup timeout, for its first output.
pub async fn ensure_stream(
    State(state): State<SharedState>,
    Path(camera_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    // 1. Resolve the camera and its source
    let camera = state
        .cameras
        .lookup(&camera_id)
        .filter(|cam| cam.enabled)
        .ok_or_else(|| ApiError::CameraNotFound(camera_id.clone()))?;
    let stream_url = camera
        .stream_url()
        .ok_or_else(|| ApiError::NoRtspUrl(camera_id.clone()))?
        .to_string();

    // 2. Make sure the transcoder can run at all
    Engine::probe_binary(&state.config.server.ffmpeg_binary)
        .await
        .map_err(ApiError::FfmpegNotAvailable)?;

    // 3. Start or reuse, then wait for output
    let slot = Engine::start_stream(&state, &camera_id, &stream_url).await;
    let timeout = Duration::from_millis(state.config.hls.startup_timeout_ms);

    match wait_for_output(&slot, timeout).await {
        StartupOutcome::Ready => {
            let url = playlist_url(&headers, &state.config.server.listen, &camera_id)
                .ok_or(ApiError::InvalidHost)?;
            info!("Stream [{}] ready at {}", camera_id, url);
            Ok(Json(json!({ "ok": true, "playlistUrl": url })))
        }
        StartupOutcome::Exited {
            exit_code,
            last_error,
        } => Err(ApiError::FfmpegExited {
            exit_code,
            last_error,
        }),
        StartupOutcome::TimedOut => Err(ApiError::StartTimeout),
    }
}

/// Polls for a playlist or segment, or for the process to die. The slot lock
/// is only held for each individual check.
async fn wait_for_output(slot: &StreamSlot, timeout: Duration) -> StartupOutcome {
    // 超大超时值视为不设上限
    let deadline = Instant::now().checked_add(timeout);

    loop {
        let exited = {
            let mut guard = slot.lock().await;
            let Some(stream) = guard.as_mut() else {
                return StartupOutcome::Exited {
                    exit_code: None,
                    last_error: Some("stream was stopped".to_string()),
                };
            };
            if stream.output.has_output().await {
                return StartupOutcome::Ready;
            }
            if stream.poll_running() {
                None
            } else {
                Some((
                    stream.exit_code,
                    stream.last_error.clone(),
                    stream.diagnostics.clone(),
                ))
            }
        };

        if let Some((exit_code, last_error, diagnostics)) = exited {
            let last_error = match last_error {
                Some(err) => Some(err),
                None => settled_last_text(&diagnostics).await,
            };
            return StartupOutcome::Exited {
                exit_code,
                last_error,
            };
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            return StartupOutcome::TimedOut;
        }
        tokio::time::sleep(ENSURE_POLL_INTERVAL).await;
    }
}

/// Gives the stderr reader a moment to drain before reading the last line.
async fn settled_last_text(diagnostics: &Arc<Mutex<DiagnosticLog>>) -> Option<String> {
    for _ in 0..EXIT_SETTLE_POLLS {
        if diagnostics.lock().await.is_closed() {
            break;
        }
        tokio::time::sleep(EXIT_SETTLE_INTERVAL).await;
    }
    diagnostics.lock().await.last_text()
}

/// 拼接对外可访问的播放列表地址，摄像头 ID 按路径段转义
fn playlist_url(headers: &HeaderMap, fallback_host: &str, camera_id: &str) -> Option<String> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let scheme = header_value("x-forwarded-proto").unwrap_or_else(|| "http".to_string());
    let host = header_value("x-forwarded-host")
        .or_else(|| header_value(header::HOST.as_str()))
        .unwrap_or_else(|| fallback_host.to_string());

    let mut url = Url::parse(&format!("{}://{}/", scheme, host))
        .or_else(|_| Url::parse(&format!("http://{}/", fallback_host)))
        .ok()?;
    url.path_segments_mut()
        .ok()?
        .clear()
        .extend(["api", "cameras", camera_id, "hls", PLAYLIST_NAME]);
    Some(url.into())
}

async fn stream_output(state: &AppState, camera_id: &str) -> Result<OutputDir, ApiError> {
    let slot = state
        .streams
        .get(camera_id)
        .await
        .ok_or(ApiError::NotStarted)?;
    let guard = slot.lock().await;
    let output = guard.as_ref().map(|stream| stream.output.clone());
    output.ok_or(ApiError::NotStarted)
}

pub async fn serve_playlist(
    State(state): State<SharedState>,
    Path(camera_id): Path<String>,
) -> Result<Response, ApiError> {
    let output = stream_output(&state, &camera_id).await?;

    let playlist = match tokio::fs::read(&output.playlist).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(ApiError::PlaylistMissing),
        Err(e) => return Err(e.into()),
    };

    Ok((
        [
            (header::CONTENT_TYPE, "application/vnd.apple.mpegurl"),
            (header::CACHE_CONTROL, "no-store"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        playlist,
    )
        .into_response())
}

pub async fn serve_segment(
    State(state): State<SharedState>,
    Path((camera_id, segment)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    // Only names the transcoder itself produces are ever served
    if !is_segment_name(&segment) {
        return Err(ApiError::InvalidSegment(segment));
    }
    let output = stream_output(&state, &camera_id).await?;

    let file = match File::open(output.segment_path(&segment)).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(ApiError::SegmentMissing(segment))
        }
        Err(e) => return Err(e.into()),
    };

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [
            (header::CONTENT_TYPE, "video/mp2t"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        body,
    )
        .into_response())
}
