use regex::Regex;
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

pub const PLAYLIST_NAME: &str = "playlist.m3u8";
/// 交给 FFmpeg 的切片文件名模板
pub const SEGMENT_TEMPLATE: &str = "seg_%d.ts";

const NAME_PREFIX_MAX: usize = 40;
const HASH_HEX_LEN: usize = 12;
const PROBE_FILE: &str = ".write-probe";

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("cannot create output directory {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("cannot remove non-file entry at playlist path {}: {source}", path.display())]
    ClearPlaylist { path: PathBuf, source: io::Error },

    #[error("output directory {} is not writable: {source}", path.display())]
    NotWritable { path: PathBuf, source: io::Error },
}

fn segment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^seg_[0-9]+\.ts$").expect("static regex"))
}

/// 仅接受 FFmpeg 生成的切片名 (`seg_<数字>.ts`)
pub fn is_segment_name(name: &str) -> bool {
    segment_regex().is_match(name)
}

/// 摄像头 ID -> 输出目录名
/// 净化后的前缀 + 原始 ID 的哈希，既不会跳出根目录，也不会与其他 ID 冲突
pub fn derive_directory_name(camera_id: &str) -> String {
    let mut prefix: String = camera_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(NAME_PREFIX_MAX)
        .collect();
    if prefix.is_empty() {
        prefix.push_str("camera");
    }

    let digest = Sha256::digest(camera_id.as_bytes());
    let hash = hex::encode(digest);
    format!("{}-{}", prefix, &hash[..HASH_HEX_LEN])
}

fn system_time_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 单路流的输出目录 (`<hls_root>/<目录名>/`)，只存放播放列表和切片
#[derive(Debug, Clone)]
pub struct OutputDir {
    pub dir: PathBuf,
    pub playlist: PathBuf,
}

impl OutputDir {
    pub fn for_camera(root: &Path, camera_id: &str) -> Self {
        let dir = root.join(derive_directory_name(camera_id));
        let playlist = dir.join(PLAYLIST_NAME);
        Self { dir, playlist }
    }

    pub fn segment_pattern(&self) -> PathBuf {
        self.dir.join(SEGMENT_TEMPLATE)
    }

    /// `name` 须先通过 [`is_segment_name`] 校验
    pub fn segment_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// 创建目录并写入探测文件，确认可写
    pub async fn ensure_writable(&self) -> Result<(), OutputError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| OutputError::CreateDir {
                path: self.dir.clone(),
                source,
            })?;

        if let Ok(meta) = fs::symlink_metadata(&self.playlist).await {
            if !meta.is_file() {
                let removed = if meta.is_dir() {
                    fs::remove_dir_all(&self.playlist).await
                } else {
                    fs::remove_file(&self.playlist).await
                };
                removed.map_err(|source| OutputError::ClearPlaylist {
                    path: self.playlist.clone(),
                    source,
                })?;
            }
        }

        let probe = self.dir.join(PROBE_FILE);
        fs::write(&probe, b"ok")
            .await
            .map_err(|source| OutputError::NotWritable {
                path: self.dir.clone(),
                source,
            })?;
        fs::remove_file(&probe)
            .await
            .map_err(|source| OutputError::NotWritable {
                path: self.dir.clone(),
                source,
            })?;
        Ok(())
    }

    /// 删除播放列表和全部切片，其他文件保持不动
    /// 返回删除的文件数
    pub async fn cleanup(&self) -> usize {
        let mut removed = 0;
        for path in self.segment_files().await {
            if remove_quietly(&path).await {
                removed += 1;
            }
        }
        if remove_quietly(&self.playlist).await {
            removed += 1;
        }
        removed
    }

    /// 删除修改时间早于 `max_age` 的切片
    pub async fn prune_stale(&self, max_age: Duration) -> usize {
        let now = SystemTime::now();
        let mut removed = 0;
        for path in self.segment_files().await {
            let Ok(meta) = fs::metadata(&path).await else {
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age > max_age && remove_quietly(&path).await {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Pruned {} stale segment(s) in {:?}", removed, self.dir);
        }
        removed
    }

    /// 最新切片的修改时间 (Unix 毫秒)
    pub async fn newest_segment_mtime_ms(&self) -> Option<u64> {
        let mut newest = None;
        for path in self.segment_files().await {
            if let Ok(modified) = fs::metadata(&path).await.and_then(|m| m.modified()) {
                let ms = system_time_ms(modified);
                newest = Some(newest.map_or(ms, |n: u64| n.max(ms)));
            }
        }
        newest
    }

    /// 已生成播放列表或任意切片
    pub async fn has_output(&self) -> bool {
        if fs::try_exists(&self.playlist).await.unwrap_or(false) {
            return true;
        }
        !self.segment_files().await.is_empty()
    }

    async fn segment_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let Ok(mut entries) = fs::read_dir(&self.dir).await else {
            return files;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if name.to_str().is_some_and(is_segment_name) {
                files.push(entry.path());
            }
        }
        files
    }
}

async fn remove_quietly(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            debug!("Failed to remove {:?}: {}", path, e);
            false
        }
    }
}
