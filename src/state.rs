use crate::cameras::CameraRegistry;
use crate::config::{AppConfig, RetryPolicy};
use crate::diagnostics::DiagnosticLog;
use crate::output::OutputDir;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// 当前时间 (Unix 毫秒)
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Stale,
    Dead,
    Restarting,
}

/// 重启计数，跨进程重启保留
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartCounters {
    /// 连续重启次数，恢复后归零
    pub restart_attempts: u32,
    /// 累计重启次数，只增不减
    pub total_restarts: u32,
    /// 下次重启前需要等待的时长
    pub current_backoff_ms: u64,
}

impl RestartCounters {
    pub fn fresh(policy: &RetryPolicy) -> Self {
        Self {
            restart_attempts: 0,
            total_restarts: 0,
            current_backoff_ms: policy.initial_backoff_ms,
        }
    }

    /// Counters for the next restart: one more attempt, backoff doubled up to the cap.
    pub fn next_attempt(&self, policy: &RetryPolicy) -> Self {
        Self {
            restart_attempts: self.restart_attempts + 1,
            total_restarts: self.total_restarts + 1,
            current_backoff_ms: self
                .current_backoff_ms
                .saturating_mul(2)
                .min(policy.max_backoff_ms),
        }
    }

    pub fn exhausted(&self, policy: &RetryPolicy) -> bool {
        self.restart_attempts >= policy.max_attempts
    }
}

/// 单路摄像头的转码流状态
pub struct StreamState {
    pub camera_id: String,
    pub output: OutputDir,
    /// 转码子进程，未运行时为 None
    pub process: Option<Child>,
    pub pid: Option<u32>,
    pub stream_url: String,
    pub binary_path: String,
    pub started_at_ms: u64,
    pub last_error: Option<String>,
    pub diagnostics: Arc<Mutex<DiagnosticLog>>,
    pub exit_code: Option<i32>,
    pub last_segment_time_ms: Option<u64>,
    pub last_successful_segment_ms: Option<u64>,
    pub counters: RestartCounters,
    pub health_status: HealthStatus,
    /// 终态日志只打印一次
    pub max_attempts_logged: bool,
}

impl StreamState {
    pub fn new(
        camera_id: &str,
        output: OutputDir,
        stream_url: &str,
        binary_path: &str,
        counters: RestartCounters,
        started_at_ms: u64,
    ) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            output,
            process: None,
            pid: None,
            stream_url: stream_url.to_string(),
            binary_path: binary_path.to_string(),
            started_at_ms,
            last_error: None,
            diagnostics: Arc::new(Mutex::new(DiagnosticLog::default())),
            exit_code: None,
            last_segment_time_ms: None,
            last_successful_segment_ms: None,
            counters,
            health_status: HealthStatus::Starting,
            max_attempts_logged: false,
        }
    }

    /// Polls the child without blocking. Returns `true` while it is still
    /// running; on the first observation of an exit the code is recorded
    /// (`-1` when killed by a signal) and the handle is dropped.
    pub fn poll_running(&mut self) -> bool {
        let Some(child) = self.process.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                let code = status.code().unwrap_or(-1);
                self.exit_code = Some(code);
                self.process = None;
                if code == 0 {
                    info!("Stream [{}] transcoder exited cleanly", self.camera_id);
                } else {
                    warn!(
                        "Stream [{}] transcoder exited unexpectedly with code {}",
                        self.camera_id, code
                    );
                }
                false
            }
            Err(e) => {
                warn!("Process monitor error [{}]: {}", self.camera_id, e);
                true
            }
        }
    }

    pub async fn snapshot(&mut self) -> StreamSnapshot {
        self.poll_running();
        let error_lines = self.diagnostics.lock().await.error_lines();
        StreamSnapshot {
            camera_id: self.camera_id.clone(),
            directory: self.output.dir.to_string_lossy().into_owned(),
            health_status: self.health_status,
            pid: self.process.as_ref().and(self.pid),
            exit_code: self.exit_code,
            last_error: self.last_error.clone(),
            restart_attempts: self.counters.restart_attempts,
            total_restarts: self.counters.total_restarts,
            current_backoff_ms: self.counters.current_backoff_ms,
            started_at_ms: self.started_at_ms,
            last_segment_time_ms: self.last_segment_time_ms,
            last_successful_segment_ms: self.last_successful_segment_ms,
            error_lines,
        }
    }
}

/// 对外展示的流状态
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSnapshot {
    pub camera_id: String,
    pub directory: String,
    pub health_status: HealthStatus,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub last_error: Option<String>,
    pub restart_attempts: u32,
    pub total_restarts: u32,
    pub current_backoff_ms: u64,
    pub started_at_ms: u64,
    pub last_segment_time_ms: Option<u64>,
    pub last_successful_segment_ms: Option<u64>,
    pub error_lines: Vec<String>,
}

/// 每路流一个独立的锁，启动/停止/健康检查都在锁内完成
pub type StreamSlot = Arc<Mutex<Option<StreamState>>>;

/// 流注册表 (Camera ID -> Slot)
///
/// Slots are never removed; a stopped stream leaves an empty slot behind so
/// that a caller already waiting on it cannot revive a stream the registry
/// no longer knows about.
#[derive(Default)]
pub struct StreamRegistry {
    slots: Mutex<BTreeMap<String, StreamSlot>>,
}

impl StreamRegistry {
    /// Returns the slot for `camera_id`, creating an empty one if needed.
    pub async fn slot(&self, camera_id: &str) -> StreamSlot {
        self.slots
            .lock()
            .await
            .entry(camera_id.to_string())
            .or_default()
            .clone()
    }

    pub async fn get(&self, camera_id: &str) -> Option<StreamSlot> {
        self.slots.lock().await.get(camera_id).cloned()
    }

    /// All slots in registry (camera id) order.
    pub async fn slots(&self) -> Vec<(String, StreamSlot)> {
        self.slots
            .lock()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect()
    }
}

/// 全局应用上下文
pub struct AppState {
    pub config: AppConfig,
    pub cameras: Arc<dyn CameraRegistry>,
    /// 活跃流表
    pub streams: StreamRegistry,
}

impl AppState {
    pub fn new(config: AppConfig, cameras: Arc<dyn CameraRegistry>) -> Self {
        Self {
            config,
            cameras,
            streams: StreamRegistry::default(),
        }
    }

    pub fn hls_root(&self) -> &Path {
        Path::new(&self.config.server.hls_root)
    }
}

pub type SharedState = Arc<AppState>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 500,
            max_backoff_ms: 5_000,
        };
        let mut counters = RestartCounters::fresh(&policy);
        for n in 1..=8u32 {
            counters = counters.next_attempt(&policy);
            assert_eq!(counters.restart_attempts, n);
            assert_eq!(counters.total_restarts, n);
            assert_eq!(
                counters.current_backoff_ms,
                (500u64 * 2u64.pow(n)).min(5_000)
            );
        }
        assert!(!counters.exhausted(&policy));
        counters.restart_attempts = 10;
        assert!(counters.exhausted(&policy));
    }

    #[tokio::test]
    async fn registry_reuses_slots_in_id_order() {
        let registry = StreamRegistry::default();
        assert!(registry.get("b").await.is_none());

        let b = registry.slot("b").await;
        let again = registry.slot("b").await;
        assert!(Arc::ptr_eq(&b, &again));
        registry.slot("a").await;

        let ids: Vec<_> = registry.slots().await.into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(b.lock().await.is_none());
    }
}
