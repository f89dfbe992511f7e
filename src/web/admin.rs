use crate::engine::Engine;
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    Json,
};

/// 获取系统状态 API
/// 返回系统的内存和负载信息
pub async fn sys_status() -> Json<serde_json::Value> {
    // 获取内存信息，默认值为 0
    let mem = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));
    // 获取负载信息，默认值为 0.0
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    Json(serde_json::json!({
        "mem_total": mem.0 / 1024, // 转换为MB
        "mem_avail": mem.1 / 1024, // 转换为MB
        "load_avg": load,
    }))
}

/// 获取流列表 API
/// 返回所有已注册流的健康状态、重启计数和最近的错误输出
pub async fn list_streams(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let mut result = Vec::new();
    for (_, slot) in state.streams.slots().await {
        let mut guard = slot.lock().await;
        if let Some(stream) = guard.as_mut() {
            result.push(stream.snapshot().await);
        }
    }

    Json(serde_json::json!({ "streams": result }))
}

/// 手动停止流 API
/// 结束转码进程、清理切片并清空该流的状态
pub async fn handle_stop(
    State(state): State<SharedState>,
    Path(camera_id): Path<String>,
) -> Json<serde_json::Value> {
    let stopped = Engine::stop_stream(&state, &camera_id).await;
    Json(serde_json::json!({ "ok": true, "stopped": stopped }))
}
