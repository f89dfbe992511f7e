use crate::cameras::StaticCameraRegistry;
use crate::config::{AppConfig, CameraConfig, RtspSource};
use crate::state::{AppState, SharedState};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// 测试用全局状态：输出根目录 `root`，转码程序 `binary`，
/// 以及已启用的 `(摄像头 ID, RTSP 地址)` 列表
pub fn test_state(root: &Path, binary: &str, cameras: &[(&str, Option<&str>)]) -> SharedState {
    let mut config = AppConfig::default();
    config.server.hls_root = root.to_string_lossy().into_owned();
    config.server.ffmpeg_binary = binary.to_string();
    config.hls.startup_timeout_ms = 5_000;
    config.cameras = cameras
        .iter()
        .map(|(id, url)| CameraConfig {
            id: id.to_string(),
            label: None,
            enabled: true,
            rtsp: Some(RtspSource {
                url: url.map(String::from),
            }),
        })
        .collect();

    let registry = Arc::new(StaticCameraRegistry::from_config(&config.cameras));
    Arc::new(AppState::new(config, registry))
}

/// Polls `check` for up to five seconds.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Writes one segment and a playlist next to the requested playlist path,
/// then keeps running. Each launch appends a line to `<hls root>/spawns.log`.
#[cfg(unix)]
pub const SERVING: &str = r#"out_dir=$(dirname "$last")
echo spawned >> "$out_dir/../spawns.log"
: > "$out_dir/seg_0.ts"
printf '#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXTINF:2.0,\nseg_0.ts\n' > "$last"
exec sleep 30
"#;

/// Runs without ever producing output.
#[cfg(unix)]
pub const IDLE: &str = "exec sleep 30\n";

/// Prints a progress line, a connection error and a plain line, then exits 1.
#[cfg(unix)]
pub const CRASHING: &str = r#"printf 'frame=    0 fps=0.0 q=0.0 size=       0kB time=00:00:00.00 bitrate=N/A speed=   0x\r' >&2
echo "[tcp @ 0x1] Connection to tcp://10.0.0.9:554 failed: Connection refused" >&2
echo "Conversion ended." >&2
exit 1
"#;

/// Writes an executable `/bin/sh` stand-in for the transcoder. It answers
/// `-version` and otherwise runs `body` with `$last` set to the final
/// argument (the playlist path).
#[cfg(unix)]
pub fn fake_transcoder(dir: &Path, body: &str) -> std::path::PathBuf {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = dir.join(format!("fake-ffmpeg-{}.sh", n));

    let script = format!(
        "#!/bin/sh\nif [ \"$1\" = \"-version\" ]; then\n  echo 'ffmpeg version fake'\n  exit 0\nfi\nfor last; do :; done\n{}",
        body
    );
    {
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(script.as_bytes()).unwrap();
        file.sync_all().unwrap();
    }
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
