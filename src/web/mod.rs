pub mod admin;
pub mod hls;

use crate::state::SharedState;
use axum::{
    routing::{delete, get},
    Router,
};

/// 注册HTTP路由
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/sys/status", get(admin::sys_status)) // 系统状态
        .route("/streams", get(admin::list_streams)) // 流状态列表
        .route("/api/cameras/:camera_id/hls", delete(admin::handle_stop)) // 停止流
        .route("/api/cameras/:camera_id/hls/ensure", get(hls::ensure_stream))
        .route(
            "/api/cameras/:camera_id/hls/playlist.m3u8",
            get(hls::serve_playlist),
        )
        .route("/api/cameras/:camera_id/hls/:segment", get(hls::serve_segment))
        .with_state(state)
}
