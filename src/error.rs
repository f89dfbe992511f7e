use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("camera not found: {0}")]
    CameraNotFound(String),

    #[error("camera {0} has no RTSP url configured")]
    NoRtspUrl(String),

    #[error("transcoder not available: {0}")]
    FfmpegNotAvailable(String),

    #[error("transcoder exited before producing output")]
    FfmpegExited {
        exit_code: Option<i32>,
        last_error: Option<String>,
    },

    #[error("timed out waiting for HLS output")]
    StartTimeout,

    #[error("stream not started")]
    NotStarted,

    #[error("playlist not written yet")]
    PlaylistMissing,

    #[error("invalid segment name: {0}")]
    InvalidSegment(String),

    #[error("segment not found: {0}")]
    SegmentMissing(String),

    #[error("cannot build a playlist url from the request host")]
    InvalidHost,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    /// Stable machine-readable code returned in the `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::CameraNotFound(_) => "camera_not_found",
            ApiError::NoRtspUrl(_) => "camera_has_no_rtsp_url",
            ApiError::FfmpegNotAvailable(_) => "ffmpeg_not_available",
            ApiError::FfmpegExited { .. } => "hls_ffmpeg_exited",
            ApiError::StartTimeout => "hls_start_timeout",
            ApiError::NotStarted => "not_started",
            ApiError::PlaylistMissing => "playlist_missing",
            ApiError::InvalidSegment(_) => "invalid_segment",
            ApiError::SegmentMissing(_) => "missing",
            ApiError::InvalidHost => "invalid_host",
            ApiError::Io(_) => "io_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::CameraNotFound(_)
            | ApiError::NotStarted
            | ApiError::PlaylistMissing
            | ApiError::SegmentMissing(_) => StatusCode::NOT_FOUND,
            ApiError::NoRtspUrl(_) | ApiError::InvalidSegment(_) | ApiError::InvalidHost => {
                StatusCode::BAD_REQUEST
            }
            ApiError::FfmpegExited { .. } | ApiError::StartTimeout => StatusCode::BAD_GATEWAY,
            ApiError::FfmpegNotAvailable(_) | ApiError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({
            "ok": false,
            "error": self.code(),
            "message": self.to_string(),
        });
        if let ApiError::FfmpegExited {
            exit_code,
            last_error,
        } = &self
        {
            body["exitCode"] = json!(exit_code);
            body["lastError"] = json!(last_error);
        }

        if status.is_server_error() {
            warn!("HLS error: {}", self);
        } else {
            debug!("HLS request rejected: {}", self);
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn exited_error_carries_diagnostics() {
        let response = ApiError::FfmpegExited {
            exit_code: Some(1),
            last_error: Some("Connection refused".into()),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"], "hls_ffmpeg_exited");
        assert_eq!(json["exitCode"], 1);
        assert_eq!(json["lastError"], "Connection refused");
    }

    #[test]
    fn codes_and_statuses() {
        let cases = [
            (ApiError::CameraNotFound("c".into()), 404, "camera_not_found"),
            (ApiError::NoRtspUrl("c".into()), 400, "camera_has_no_rtsp_url"),
            (ApiError::FfmpegNotAvailable("x".into()), 500, "ffmpeg_not_available"),
            (ApiError::StartTimeout, 502, "hls_start_timeout"),
            (ApiError::NotStarted, 404, "not_started"),
            (ApiError::PlaylistMissing, 404, "playlist_missing"),
            (ApiError::InvalidSegment("x".into()), 400, "invalid_segment"),
            (ApiError::SegmentMissing("x".into()), 404, "missing"),
            (ApiError::InvalidHost, 400, "invalid_host"),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status().as_u16(), status);
            assert_eq!(err.code(), code);
        }
    }
}
