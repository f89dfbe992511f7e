use crate::config::HlsConfig;
use crate::engine::Engine;
use crate::state::{now_ms, AppState, HealthStatus, StreamState};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// 终态日志中最多打印的原始输出行数
const TERMINAL_TAIL_LINES: usize = 20;

/// 单次检查的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// 进程在运行，尚未产出切片，仍在启动超时之内
    Starting,
    NotRunning,
    StartupTimeout,
    StaleSegments,
}

impl Verdict {
    pub fn reason(self) -> &'static str {
        match self {
            Verdict::Healthy => "healthy",
            Verdict::Starting => "starting",
            Verdict::NotRunning => "ffmpeg_not_running",
            Verdict::StartupTimeout => "startup_timeout",
            Verdict::StaleSegments => "stale_segments",
        }
    }
}

pub fn assess(
    running: bool,
    last_segment_ms: Option<u64>,
    started_at_ms: u64,
    now_ms: u64,
    hls: &HlsConfig,
) -> Verdict {
    if !running {
        return Verdict::NotRunning;
    }
    match last_segment_ms {
        None if now_ms.saturating_sub(started_at_ms) > hls.startup_timeout_ms => {
            Verdict::StartupTimeout
        }
        None => Verdict::Starting,
        Some(seg) if now_ms.saturating_sub(seg) > hls.stale_threshold_ms() => {
            Verdict::StaleSegments
        }
        Some(_) => Verdict::Healthy,
    }
}

/// 启动后台健康检查任务
///
/// Ticks run one after another on a single task; a slow tick delays the
/// next one instead of overlapping it.
pub async fn start_supervisor(state: Arc<AppState>, interval_ms: u64) {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        run_tick(&state, now_ms()).await;
    }
}

/// 单次巡检，按注册表顺序逐路检查
pub async fn run_tick(state: &AppState, now_ms: u64) {
    for (_, slot) in state.streams.slots().await {
        let mut guard = slot.lock().await;
        check_stream(state, &mut guard, now_ms).await;
    }
}

async fn check_stream(
    state: &AppState,
    slot: &mut Option<StreamState>,
    now_ms: u64,
) {
    let hls = &state.config.hls;
    let policy = &hls.retry;
    let Some(stream) = slot.as_mut() else {
        return;
    };

    // 1. 切片时间前进视为恢复信号，先于故障判断
    if let Some(mtime) = stream.output.newest_segment_mtime_ms().await {
        if stream.last_segment_time_ms.map_or(true, |prev| mtime > prev) {
            stream.last_segment_time_ms = Some(mtime);
            stream.last_successful_segment_ms = Some(mtime);
            if now_ms.saturating_sub(mtime) < hls.stale_threshold_ms() {
                if stream.counters.restart_attempts > 0 {
                    info!(
                        "Stream [{}] recovered after {} restart attempt(s)",
                        stream.camera_id, stream.counters.restart_attempts
                    );
                }
                stream.counters.restart_attempts = 0;
                stream.counters.current_backoff_ms = policy.initial_backoff_ms;
                stream.health_status = HealthStatus::Healthy;
                stream.max_attempts_logged = false;
            }
        }
    }

    // 2. 无论健康与否都清理过期切片
    stream
        .output
        .prune_stale(Duration::from_secs(hls.max_segment_age_sec))
        .await;

    // 3. 判定健康状态
    let running = stream.poll_running();
    let verdict = assess(
        running,
        stream.last_segment_time_ms,
        stream.started_at_ms,
        now_ms,
        hls,
    );
    match verdict {
        Verdict::Healthy => {
            stream.health_status = HealthStatus::Healthy;
            return;
        }
        Verdict::Starting => {
            stream.health_status = HealthStatus::Starting;
            return;
        }
        _ => {}
    }

    stream.health_status = if verdict == Verdict::NotRunning {
        HealthStatus::Dead
    } else {
        HealthStatus::Stale
    };

    // 重试次数耗尽：记录一次终态日志后保持 dead
    if stream.counters.exhausted(policy) {
        if stream.max_attempts_logged {
            return;
        }
        report_terminal(stream, verdict, policy.max_attempts).await;
        stream.max_attempts_logged = true;
        Engine::kill_process(stream).await;
        stream.output.cleanup().await;
        stream.health_status = HealthStatus::Dead;
        return;
    }

    // 退避窗口内不重启
    let since_start = now_ms.saturating_sub(stream.started_at_ms);
    if since_start <= stream.counters.current_backoff_ms {
        debug!(
            "Stream [{}] unhealthy ({}), waiting out backoff ({}ms of {}ms)",
            stream.camera_id,
            verdict.reason(),
            since_start,
            stream.counters.current_backoff_ms
        );
        return;
    }

    let counters = stream.counters.next_attempt(policy);
    warn!(
        "Stream [{}] unhealthy ({}). Restart {}/{}, next backoff {}ms.",
        stream.camera_id,
        verdict.reason(),
        counters.restart_attempts,
        policy.max_attempts,
        counters.current_backoff_ms
    );
    Engine::kill_process(stream).await;
    stream.output.cleanup().await;

    let camera_id = stream.camera_id.clone();
    let stream_url = stream.stream_url.clone();
    let binary = stream.binary_path.clone();
    Engine::start_locked(
        state,
        slot,
        &camera_id,
        &stream_url,
        &binary,
        counters,
        now_ms,
    )
    .await;

    // 新进程在下一轮巡检判定之前保持 restarting
    if let Some(restarted) = slot.as_mut() {
        if restarted.process.is_some() {
            restarted.health_status = HealthStatus::Restarting;
        }
    }
}

async fn report_terminal(stream: &StreamState, verdict: Verdict, max_attempts: u32) {
    let log = stream.diagnostics.lock().await;
    let errors = log.error_lines();
    let (kind, lines) = if errors.is_empty() {
        ("last output", log.last_lines(TERMINAL_TAIL_LINES))
    } else {
        ("error lines", errors)
    };
    let exit_code = stream
        .exit_code
        .map_or_else(|| "none".to_string(), |c| c.to_string());

    error!(
        "Stream [{}] reached max restart attempts ({}). Giving up. reason={} exit_code={} last_error={:?} {}:\n{}",
        stream.camera_id,
        max_attempts,
        verdict.reason(),
        exit_code,
        stream.last_error,
        kind,
        lines.join("\n")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{RestartCounters, SharedState};
    use crate::test_support::test_state;
    use tempfile::TempDir;

    #[test]
    fn assess_covers_each_failure_mode() {
        let hls = HlsConfig {
            startup_timeout_ms: 10_000,
            stale_threshold_sec: 20,
            ..HlsConfig::default()
        };
        let t0 = 1_000_000;

        assert_eq!(assess(false, Some(t0), t0, t0, &hls), Verdict::NotRunning);
        assert_eq!(assess(true, None, t0, t0 + 5_000, &hls), Verdict::Starting);
        assert_eq!(
            assess(true, None, t0, t0 + 10_001, &hls),
            Verdict::StartupTimeout
        );
        assert_eq!(
            assess(true, Some(t0), t0, t0 + 20_000, &hls),
            Verdict::Healthy
        );
        assert_eq!(
            assess(true, Some(t0), t0, t0 + 20_001, &hls),
            Verdict::StaleSegments
        );
        assert_eq!(Verdict::NotRunning.reason(), "ffmpeg_not_running");
    }

    #[test]
    fn assess_tolerates_huge_thresholds() {
        let hls = HlsConfig {
            startup_timeout_ms: u64::MAX,
            stale_threshold_sec: u64::MAX,
            ..HlsConfig::default()
        };
        assert_eq!(assess(true, Some(0), 0, u64::MAX, &hls), Verdict::Healthy);
        assert_eq!(assess(true, None, 0, u64::MAX, &hls), Verdict::Starting);
    }

    fn failing_state(tmp: &TempDir, max_attempts: u32) -> SharedState {
        let mut state = test_state(tmp.path(), "/definitely/not/here/ffmpeg", &[]);
        let config = &mut Arc::get_mut(&mut state).unwrap().config;
        config.hls.retry.max_attempts = max_attempts;
        config.hls.retry.initial_backoff_ms = 100;
        config.hls.retry.max_backoff_ms = 1_000;
        state
    }

    async fn snapshot(state: &AppState, id: &str) -> (HealthStatus, RestartCounters, u64) {
        let slot = state.streams.get(id).await.unwrap();
        let guard = slot.lock().await;
        let s = guard.as_ref().unwrap();
        (s.health_status, s.counters, s.started_at_ms)
    }

    #[tokio::test]
    async fn restarts_back_off_then_give_up_once() {
        let tmp = TempDir::new().unwrap();
        let state = failing_state(&tmp, 4);
        let slot = Engine::start_stream(&state, "cam1", "rtsp://x").await;

        let (status, initial, mut started) = snapshot(&state, "cam1").await;
        assert_eq!(status, HealthStatus::Dead);
        assert_eq!(initial.current_backoff_ms, 100);

        // inside the backoff window nothing is spawned
        run_tick(&state, started + 50).await;
        let (status, counters, s) = snapshot(&state, "cam1").await;
        assert_eq!(status, HealthStatus::Dead);
        assert_eq!(counters, initial);
        assert_eq!(s, started);

        for n in 1..=4u32 {
            let (_, before, _) = snapshot(&state, "cam1").await;
            let now = started + before.current_backoff_ms + 1;
            run_tick(&state, now).await;

            let (status, after, s) = snapshot(&state, "cam1").await;
            // the binary is missing, so every new incarnation is dead on arrival
            assert_eq!(status, HealthStatus::Dead);
            assert_eq!(after.restart_attempts, n);
            assert_eq!(after.total_restarts, n);
            assert_eq!(after.current_backoff_ms, (100u64 << n).min(1_000));
            assert_eq!(s, now);
            started = s;
        }

        run_tick(&state, started + 60_000).await;
        let dir = {
            let guard = slot.lock().await;
            let stream = guard.as_ref().unwrap();
            assert!(stream.max_attempts_logged);
            stream.output.dir.clone()
        };

        // give-up cleans the directory once; later ticks leave it alone
        std::fs::create_dir_all(&dir).unwrap();
        let marker = dir.join("seg_9.ts");
        std::fs::write(&marker, b"ts").unwrap();
        for i in 2..=10u64 {
            run_tick(&state, started + 60_000 * i).await;
        }
        assert!(marker.exists());

        let (status, counters, s) = snapshot(&state, "cam1").await;
        assert_eq!(status, HealthStatus::Dead);
        assert_eq!(counters.restart_attempts, 4);
        assert_eq!(counters.total_restarts, 4);
        assert_eq!(s, started);
        assert!(slot.lock().await.as_ref().unwrap().max_attempts_logged);
    }

    #[tokio::test]
    async fn stopped_streams_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let state = failing_state(&tmp, 3);
        let slot = Engine::start_stream(&state, "cam1", "rtsp://x").await;
        assert!(Engine::stop_stream(&state, "cam1").await);

        run_tick(&state, now_ms() + 1_000_000).await;
        assert!(slot.lock().await.is_none());
    }

    #[tokio::test]
    async fn fresh_segment_resets_restart_budget() {
        let tmp = TempDir::new().unwrap();
        let state = failing_state(&tmp, 3);
        let slot = Engine::start_stream(&state, "cam1", "rtsp://x").await;

        let (dir, started) = {
            let mut guard = slot.lock().await;
            let stream = guard.as_mut().unwrap();
            stream.counters = RestartCounters {
                restart_attempts: 2,
                total_restarts: 5,
                current_backoff_ms: 800,
            };
            stream.max_attempts_logged = true;
            (stream.output.dir.clone(), stream.started_at_ms)
        };
        std::fs::write(dir.join("seg_4.ts"), b"ts").unwrap();

        // the process is gone, so the stream is still flagged afterwards,
        // but the budget and backoff are back at their floor
        run_tick(&state, started).await;

        let guard = slot.lock().await;
        let stream = guard.as_ref().unwrap();
        assert_eq!(stream.started_at_ms, started);
        assert_eq!(stream.counters.restart_attempts, 0);
        assert_eq!(stream.counters.total_restarts, 5);
        assert_eq!(stream.counters.current_backoff_ms, 100);
        assert!(!stream.max_attempts_logged);
        assert!(stream.last_segment_time_ms.is_some());
        assert_eq!(stream.health_status, HealthStatus::Dead);
    }

    #[tokio::test]
    async fn prune_runs_regardless_of_health() {
        use std::fs::{File, FileTimes};
        use std::time::SystemTime;

        let tmp = TempDir::new().unwrap();
        let state = failing_state(&tmp, 0);
        let slot = Engine::start_stream(&state, "cam1", "rtsp://x").await;
        let dir = slot.lock().await.as_ref().unwrap().output.dir.clone();

        let old = dir.join("seg_1.ts");
        std::fs::write(&old, b"ts").unwrap();
        let past = SystemTime::now() - Duration::from_secs(3_600);
        File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_times(FileTimes::new().set_modified(past))
            .unwrap();

        run_tick(&state, now_ms()).await;
        assert!(!old.exists());
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::test_support::{fake_transcoder, SERVING};

        async fn status_of(state: &AppState, id: &str) -> HealthStatus {
            snapshot(state, id).await.0
        }

        // Scenario C: healthy, then the segment goes stale.
        #[tokio::test]
        async fn stale_stream_is_restarted_after_backoff() {
            let tmp = TempDir::new().unwrap();
            let bin = fake_transcoder(tmp.path(), SERVING);
            let mut state = test_state(&tmp.path().join("hls"), bin.to_str().unwrap(), &[]);
            {
                let config = &mut Arc::get_mut(&mut state).unwrap().config;
                config.hls.stale_threshold_sec = 5;
                config.hls.retry.initial_backoff_ms = 1_000;
            }

            let slot = Engine::start_stream(&state, "cam3", "rtsp://x").await;
            let (dir, first_pid) = {
                let guard = slot.lock().await;
                let stream = guard.as_ref().unwrap();
                (stream.output.dir.clone(), stream.pid)
            };
            let produced = crate::test_support::wait_until(|| {
                let seg = dir.join("seg_0.ts");
                async move { seg.exists() }
            })
            .await;
            assert!(produced);

            let now = now_ms();
            run_tick(&state, now).await;
            assert_eq!(status_of(&state, "cam3").await, HealthStatus::Healthy);

            let later = now + 6_000;
            run_tick(&state, later).await;
            {
                let guard = slot.lock().await;
                let stream = guard.as_ref().unwrap();
                assert_ne!(stream.pid, first_pid);
                assert!(stream.pid.is_some());
                assert_eq!(stream.counters.restart_attempts, 1);
                assert_eq!(stream.counters.current_backoff_ms, 2_000);
                assert_eq!(stream.started_at_ms, later);
                assert_eq!(stream.health_status, HealthStatus::Restarting);
            }

            // the next tick judges the new incarnation on its own output
            run_tick(&state, now_ms()).await;
            let status = status_of(&state, "cam3").await;
            assert!(
                matches!(status, HealthStatus::Starting | HealthStatus::Healthy),
                "{status:?}"
            );
            Engine::stop_stream(&state, "cam3").await;
        }
    }
}
