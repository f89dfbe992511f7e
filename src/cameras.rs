use crate::config::CameraConfig;
use std::collections::HashMap;

/// What the stream supervisor needs to know about a camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraRecord {
    pub enabled: bool,
    pub rtsp_url: Option<String>,
}

impl CameraRecord {
    /// The configured RTSP url, ignoring blank values.
    pub fn stream_url(&self) -> Option<&str> {
        self.rtsp_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// Read-only view of the camera registry. The supervisor never writes to it.
pub trait CameraRegistry: Send + Sync {
    fn lookup(&self, camera_id: &str) -> Option<CameraRecord>;
}

/// Registry backed by the `cameras` section of the config file.
pub struct StaticCameraRegistry {
    cameras: HashMap<String, CameraRecord>,
}

impl StaticCameraRegistry {
    pub fn from_config(cameras: &[CameraConfig]) -> Self {
        let cameras = cameras
            .iter()
            .map(|cam| {
                let record = CameraRecord {
                    enabled: cam.enabled,
                    rtsp_url: cam.rtsp.as_ref().and_then(|r| r.url.clone()),
                };
                (cam.id.clone(), record)
            })
            .collect();
        Self { cameras }
    }
}

impl CameraRegistry for StaticCameraRegistry {
    fn lookup(&self, camera_id: &str) -> Option<CameraRecord> {
        self.cameras.get(camera_id).cloned()
    }
}
