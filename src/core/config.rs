use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::error::Result;
use super::types::TrackType;

/// 管线调优参数
///
/// 所有字段都有默认值，配置文件里只需要写想覆盖的项。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 所有流排队数据包的总字节上限，超过后解封装线程暂停读取
    pub max_queue_bytes: usize,
    /// 每个流至少缓冲多少毫秒数据
    pub min_buffered_ms: i64,
    /// 视频 / 字幕帧队列长度
    pub video_frame_queue: usize,
    /// 音频帧队列长度（更大，吸收抖动）
    pub audio_frame_queue: usize,
    /// 空闲重试间隔（毫秒）
    pub idle_interval_ms: u64,
    /// 音频设备缓冲区时长（毫秒）
    pub audio_buffer_ms: i64,
    /// 位置通知的最小间隔（毫秒）
    pub position_interval_ms: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_queue_bytes: 50 * 1024 * 1024,
            min_buffered_ms: 200,
            video_frame_queue: 3,
            audio_frame_queue: 9,
            idle_interval_ms: 10,
            audio_buffer_ms: 100,
            position_interval_ms: 100,
        }
    }
}

impl EngineConfig {
    /// 从 JSON 文件加载
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn frame_queue_size(&self, kind: TrackType) -> usize {
        match kind {
            TrackType::Audio => self.audio_frame_queue.max(1),
            TrackType::Video | TrackType::Subtitle => self.video_frame_queue.max(1),
        }
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}
