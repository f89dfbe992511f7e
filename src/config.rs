use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub hls: HlsConfig,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen: String,
    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg_binary: String,
    /// 健康检查周期 (毫秒)
    #[serde(default = "default_supervisor_interval_ms")]
    pub supervisor_interval_ms: u64,

    /// HLS 切片存储根目录
    /// 建议配置为 /dev/shm/cam-hls 以保护闪存寿命
    #[serde(default = "default_hls_root")]
    pub hls_root: String,

    /// 进程退出时是否删除磁盘上的切片
    #[serde(default = "default_true")]
    pub cleanup_on_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            ffmpeg_binary: default_ffmpeg_binary(),
            supervisor_interval_ms: default_supervisor_interval_ms(),
            hls_root: default_hls_root(),
            cleanup_on_shutdown: true,
        }
    }
}

/// 转码与健康检查参数
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HlsConfig {
    /// 单个切片时长 (秒)
    pub segment_seconds: u32,
    /// 播放列表保留的切片数量
    pub list_size: u32,
    /// 输出帧率
    pub output_fps: u32,
    /// GOP 长度，缺省为 segment_seconds * output_fps
    pub gop_size: Option<u32>,
    /// 探测源流时读取的字节数
    pub probe_size: u64,
    /// 探测源流的时长 (微秒)
    pub analyze_duration_us: u64,
    pub rtsp_transport: RtspTransport,
    /// 首个切片的等待上限 (毫秒)
    pub startup_timeout_ms: u64,
    /// 超过该时长的切片直接删除 (秒)
    pub max_segment_age_sec: u64,
    /// 最新切片超过该时长视为卡死并触发重启 (秒)
    pub stale_threshold_sec: u64,

    /// 故障重试策略
    pub retry: RetryPolicy,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            segment_seconds: 2,
            list_size: 6,
            output_fps: 15,
            gop_size: None,
            probe_size: 1_000_000,
            analyze_duration_us: 1_000_000,
            rtsp_transport: RtspTransport::Tcp,
            startup_timeout_ms: 15_000,
            max_segment_age_sec: 60,
            stale_threshold_sec: 20,
            retry: RetryPolicy::default(),
        }
    }
}

impl HlsConfig {
    pub fn gop(&self) -> u32 {
        self.gop_size
            .unwrap_or(self.segment_seconds.saturating_mul(self.output_fps))
            .max(1)
    }

    /// 卡死判定阈值 (毫秒)
    pub fn stale_threshold_ms(&self) -> u64 {
        self.stale_threshold_sec.saturating_mul(1000)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RtspTransport {
    #[default]
    Tcp,
    Udp,
}

impl RtspTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            RtspTransport::Tcp => "tcp",
            RtspTransport::Udp => "udp",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryPolicy {
    /// 最大重试次数，达到后流保持 dead 直到外部重新启动
    pub max_attempts: u32,
    /// 初始退避时间 (毫秒)
    pub initial_backoff_ms: u64,
    /// 最大退避时间 (毫秒)
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
        }
    }
}

/// 摄像头登记信息 (只读)
#[derive(Debug, Deserialize, Clone)]
pub struct CameraConfig {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rtsp: Option<RtspSource>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RtspSource {
    #[serde(default)]
    pub url: Option<String>,
}

fn default_ffmpeg_binary() -> String {
    "ffmpeg".to_string()
}

fn default_supervisor_interval_ms() -> u64 {
    2_000
}

fn default_hls_root() -> String {
    "./static/hls".to_string()
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: AppConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let hls = &self.hls;
        if hls.segment_seconds == 0 {
            bail!("hls.segment_seconds must be greater than 0");
        }
        if hls.list_size == 0 {
            bail!("hls.list_size must be greater than 0");
        }
        if hls.output_fps == 0 {
            bail!("hls.output_fps must be greater than 0");
        }
        if self.server.supervisor_interval_ms == 0 {
            bail!("server.supervisor_interval_ms must be greater than 0");
        }
        if hls.retry.initial_backoff_ms > hls.retry.max_backoff_ms {
            bail!(
                "hls.retry.initial_backoff_ms ({}) exceeds hls.retry.max_backoff_ms ({})",
                hls.retry.initial_backoff_ms,
                hls.retry.max_backoff_ms
            );
        }

        let mut seen = HashSet::new();
        for cam in &self.cameras {
            if !seen.insert(cam.id.as_str()) {
                bail!("duplicate camera id: {}", cam.id);
            }
        }
        Ok(())
    }
}
