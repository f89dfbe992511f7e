use crate::config::HlsConfig;
use crate::diagnostics::DiagnosticLog;
use crate::output::OutputDir;
use crate::state::{now_ms, AppState, HealthStatus, RestartCounters, StreamSlot, StreamState};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// 低于该可用内存 (KB) 时拒绝启动新的转码进程
const MIN_AVAILABLE_MEMORY_KB: u64 = 5120;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// stderr 单行最大长度，超出部分按行截断
const MAX_LINE_BYTES: usize = 4096;

pub struct Engine;

impl Engine {
    /// FFmpeg 参数表，顺序固定
    pub fn build_args(hls: &HlsConfig, stream_url: &str, output: &OutputDir) -> Vec<String> {
        let seg = hls.segment_seconds.to_string();
        let gop = hls.gop().to_string();
        let probe_size = hls.probe_size.to_string();
        let analyze = hls.analyze_duration_us.to_string();
        let fps = hls.output_fps.to_string();
        let list_size = hls.list_size.to_string();
        let keyframes = format!("expr:gte(t,n_forced*{})", seg);
        let segment_pattern = output.segment_pattern().to_string_lossy().into_owned();
        let playlist = output.playlist.to_string_lossy().into_owned();
        let mut args: Vec<String> = Vec::with_capacity(64);
        let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

        push(&["-hide_banner", "-loglevel", "warning", "-stats"]);
        // 源流时间戳可能缺失或不单调
        push(&["-fflags", "+genpts+discardcorrupt", "-use_wallclock_as_timestamps", "1"]);
        push(&["-rtsp_transport", hls.rtsp_transport.as_str()]);
        push(&["-probesize", &probe_size]);
        push(&["-analyzeduration", &analyze]);
        push(&["-i", stream_url]);
        push(&["-an", "-sn", "-dn"]);
        push(&[
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-tune",
            "zerolatency",
            "-pix_fmt",
            "yuv420p",
        ]);
        push(&["-r", &fps]);
        push(&["-g", &gop, "-keyint_min", &gop, "-sc_threshold", "0"]);
        push(&["-force_key_frames", &keyframes]);
        push(&[
            "-f",
            "hls",
            "-hls_time",
            &seg,
            "-hls_list_size",
            &list_size,
            "-hls_flags",
            "delete_segments+append_list+omit_endlist",
        ]);
        push(&["-hls_segment_filename", &segment_pattern, &playlist]);
        args
    }

    /// 检查转码程序是否可执行
    pub async fn probe_binary(binary: &str) -> Result<(), String> {
        let mut cmd = Command::new(binary);
        cmd.arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(PROBE_TIMEOUT, cmd.status()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(format!("{} -version exited with {}", binary, status)),
            Ok(Err(e)) => Err(format!("cannot run {}: {}", binary, e)),
            Err(_) => Err(format!("{} -version timed out", binary)),
        }
    }

    /// 启动指定摄像头的转码流 (外部调用入口)
    ///
    /// A stream that is still running is returned untouched. A stream that
    /// exhausted its restart budget is treated as an explicit restart request:
    /// its attempt counter and backoff are reset, the lifetime restart total
    /// is kept. Any other stopped stream keeps its counters.
    pub async fn start_stream(state: &AppState, camera_id: &str, stream_url: &str) -> StreamSlot {
        let slot = state.streams.slot(camera_id).await;
        {
            let mut guard = slot.lock().await;
            let policy = &state.config.hls.retry;
            let counters = match guard.as_ref() {
                Some(prev) if prev.counters.exhausted(policy) => {
                    info!(
                        "Stream [{}] restart budget exhausted, resetting on external start",
                        camera_id
                    );
                    RestartCounters {
                        total_restarts: prev.counters.total_restarts,
                        ..RestartCounters::fresh(policy)
                    }
                }
                Some(prev) => prev.counters,
                None => RestartCounters::fresh(policy),
            };
            Self::start_locked(
                state,
                &mut guard,
                camera_id,
                stream_url,
                &state.config.server.ffmpeg_binary,
                counters,
                now_ms(),
            )
            .await;
        }
        slot
    }

    /// Spawns a transcoder into an already-locked slot. Restart counters are
    /// supplied by the caller.
    pub(crate) async fn start_locked(
        state: &AppState,
        slot: &mut Option<StreamState>,
        camera_id: &str,
        stream_url: &str,
        binary: &str,
        counters: RestartCounters,
        started_at_ms: u64,
    ) {
        // 1. 已在运行则直接返回
        if let Some(existing) = slot.as_mut() {
            if existing.poll_running() {
                debug!(
                    "Stream [{}] already running (pid {:?})",
                    camera_id, existing.pid
                );
                return;
            }
        }
        let last_success = slot.as_ref().and_then(|s| s.last_successful_segment_ms);

        // 2. 清理旧切片并确认目录可写
        let output = OutputDir::for_camera(state.hls_root(), camera_id);
        output.cleanup().await;

        let mut stream =
            StreamState::new(camera_id, output, stream_url, binary, counters, started_at_ms);
        stream.last_successful_segment_ms = last_success;

        if let Err(reason) = Self::preflight(&stream.output).await {
            error!("Stream [{}] cannot start: {}", camera_id, reason);
            stream.last_error = Some(reason);
            stream.health_status = HealthStatus::Dead;
            *slot = Some(stream);
            return;
        }

        // 3. 构建 FFmpeg 命令并启动子进程
        let args = Self::build_args(&state.config.hls, stream_url, &stream.output);
        info!(
            "Starting stream [{}]. HLS Output: {:?}",
            camera_id, stream.output.dir
        );

        let mut cmd = Command::new(binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match cmd.spawn() {
            Ok(mut child) => {
                match child.stderr.take() {
                    Some(stderr) => {
                        Self::spawn_stderr_pump(camera_id, stderr, stream.diagnostics.clone())
                    }
                    None => stream.diagnostics.lock().await.close(),
                }
                stream.pid = child.id();
                stream.process = Some(child);
            }
            Err(e) => {
                error!("Failed to spawn FFmpeg process [{}]: {}", camera_id, e);
                stream.last_error = Some(format!("failed to spawn {}: {}", binary, e));
                stream.health_status = HealthStatus::Dead;
            }
        }

        *slot = Some(stream);
    }

    /// 启动前检查：系统内存、输出目录可写
    async fn preflight(output: &OutputDir) -> Result<(), String> {
        match sys_info::mem_info() {
            Ok(mem) => {
                if mem.avail < MIN_AVAILABLE_MEMORY_KB {
                    return Err(format!(
                        "insufficient system memory ({} KB available)",
                        mem.avail
                    ));
                }
            }
            Err(e) => {
                // 无法获取内存信息时仅记录警告
                warn!("Failed to check memory usage: {}", e);
            }
        }

        output.ensure_writable().await.map_err(|e| e.to_string())
    }

    /// Reads stderr until EOF, splitting on both `\n` and `\r` since the
    /// progress line is rewritten in place.
    fn spawn_stderr_pump(camera_id: &str, mut stderr: ChildStderr, log: Arc<Mutex<DiagnosticLog>>) {
        let camera_id = camera_id.to_string();
        tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            let mut pending: Vec<u8> = Vec::new();

            loop {
                let n = match stderr.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Stream [{}] stderr read failed: {}", camera_id, e);
                        break;
                    }
                };
                pending.extend_from_slice(&chunk[..n]);

                let mut lines = Vec::new();
                while let Some(pos) = pending.iter().position(|b| *b == b'\n' || *b == b'\r') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    lines.push(line);
                }
                if pending.len() > MAX_LINE_BYTES {
                    lines.push(std::mem::take(&mut pending));
                }
                record_lines(&camera_id, &log, lines).await;
            }

            if !pending.is_empty() {
                record_lines(&camera_id, &log, vec![pending]).await;
            }
            log.lock().await.close();
        });
    }

    /// 强制结束子进程 (不做优雅退出)
    pub(crate) async fn kill_process(stream: &mut StreamState) {
        if let Some(mut child) = stream.process.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill transcoder [{}]: {}", stream.camera_id, e);
            }
            if let Ok(Some(status)) = child.try_wait() {
                stream.exit_code = Some(status.code().unwrap_or(-1));
            }
        }
    }

    /// 停止指定摄像头的转码流并清理切片
    ///
    /// Returns `false` if the stream was not registered.
    pub async fn stop_stream(state: &AppState, camera_id: &str) -> bool {
        let Some(slot) = state.streams.get(camera_id).await else {
            return false;
        };
        let mut guard = slot.lock().await;
        let Some(mut stream) = guard.take() else {
            return false;
        };

        Self::kill_process(&mut stream).await;
        stream.output.cleanup().await;
        info!("Stream [{}] stopped.", camera_id);
        true
    }

    /// 进程退出时结束所有转码进程
    pub async fn shutdown_all(state: &AppState) {
        let remove_output = state.config.server.cleanup_on_shutdown;
        for (camera_id, slot) in state.streams.slots().await {
            let mut guard = slot.lock().await;
            let Some(mut stream) = guard.take() else {
                continue;
            };
            Self::kill_process(&mut stream).await;
            if remove_output {
                stream.output.cleanup().await;
                let _ = tokio::fs::remove_dir(&stream.output.dir).await;
            }
            info!("Stream [{}] shut down.", camera_id);
        }
    }
}

async fn record_lines(camera_id: &str, log: &Mutex<DiagnosticLog>, lines: Vec<Vec<u8>>) {
    if lines.is_empty() {
        return;
    }
    let mut log = log.lock().await;
    for raw in lines {
        let text = String::from_utf8_lossy(&raw);
        let line = text.trim();
        if line.is_empty() {
            continue;
        }
        if log.record(line) {
            warn!("Stream [{}] ffmpeg: {}", camera_id, line);
        }
    }
}
