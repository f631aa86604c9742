use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::error::ErrorKind;

/// 轨道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackType {
    Video,
    Audio,
    Subtitle,
}

impl TrackType {
    pub const ALL: [TrackType; 3] = [TrackType::Video, TrackType::Audio, TrackType::Subtitle];

    /// 用于按类型索引的数组下标
    pub fn index(self) -> usize {
        match self {
            TrackType::Video => 0,
            TrackType::Audio => 1,
            TrackType::Subtitle => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackType::Video => "video",
            TrackType::Audio => "audio",
            TrackType::Subtitle => "subtitle",
        }
    }
}

/// 容器内单个流的描述（同时作为轨道列表的元数据）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamInfo {
    pub index: usize,
    /// None 表示数据 / 附件等不可解码的流
    pub kind: Option<TrackType>,
    pub is_default: bool,
    pub duration: i64,              // 毫秒
    pub codec: String,
    pub bit_rate: i64,
    pub language: Option<String>,
    /// 平均帧率（分子, 分母），仅视频
    pub frame_rate: Option<(i32, i32)>,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
}

impl StreamInfo {
    /// 按平均帧率估算单帧时长（毫秒，四舍五入）
    pub fn frame_duration(&self) -> Option<i64> {
        match self.frame_rate {
            Some((num, den)) if num > 0 && den > 0 => {
                let (num, den) = (num as i64, den as i64);
                Some((1000 * den + (num >> 1)) / num)
            }
            _ => None,
        }
    }
}

/// 容器级元数据
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaMetaData {
    pub format: String,
    pub tags: BTreeMap<String, String>,
}

/// 压缩数据包
///
/// 内部共享所有权：最后一个持有者释放底层 FFmpeg 缓冲区。
/// `inner == None` 是显式的流结束标记。
#[derive(Clone)]
pub struct Packet {
    inner: Option<Arc<PacketData>>,
}

pub struct PacketData {
    pub stream_index: usize,
    pub pts: Option<i64>,       // 毫秒
    pub duration: i64,          // 毫秒
    pub raw: ffmpeg_next::Packet,
}

impl Packet {
    pub fn new(raw: ffmpeg_next::Packet, stream_index: usize, pts: Option<i64>, duration: i64) -> Self {
        Self {
            inner: Some(Arc::new(PacketData {
                stream_index,
                pts,
                duration: duration.max(0),
                raw,
            })),
        }
    }

    /// 流结束标记
    pub fn end_of_stream() -> Self {
        Self { inner: None }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.inner.is_none()
    }

    pub fn data(&self) -> Option<&PacketData> {
        self.inner.as_deref()
    }

    pub fn stream_index(&self) -> Option<usize> {
        self.data().map(|d| d.stream_index)
    }

    pub fn pts(&self) -> Option<i64> {
        self.data().and_then(|d| d.pts)
    }

    pub fn duration(&self) -> i64 {
        self.data().map(|d| d.duration).unwrap_or(0)
    }

    pub fn size(&self) -> usize {
        self.data().map(|d| d.raw.size()).unwrap_or(0)
    }
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    RGBA,
}

/// 视频帧数据
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub pts: i64,           // 开始显示时间（毫秒）
    pub duration: i64,      // 帧持续时间（毫秒）
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Arc<[u8]>,    // 可与 sink 共享
}

/// 音频帧数据（交错 f32）
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pts: i64,           // 毫秒
    pub sample_rate: u32,
    pub channels: u16,
    pub data: Vec<f32>,
}

impl AudioFrame {
    pub fn samples(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.data.len() / self.channels as usize
        }
    }

    pub fn duration(&self) -> i64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples() as i64 * 1000 / self.sample_rate as i64
    }
}

/// 字幕帧数据
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleFrame {
    pub pts: i64,           // 开始显示时间戳（毫秒）
    pub end_pts: i64,       // 结束显示时间戳（毫秒）
    pub text: String,
}

/// 解码后的帧
#[derive(Debug, Clone)]
pub enum Frame {
    Video(VideoFrame),
    Audio(AudioFrame),
    Subtitle(SubtitleFrame),
}

impl Frame {
    pub fn pts(&self) -> i64 {
        match self {
            Frame::Video(f) => f.pts,
            Frame::Audio(f) => f.pts,
            Frame::Subtitle(f) => f.pts,
        }
    }

    pub fn kind(&self) -> TrackType {
        match self {
            Frame::Video(_) => TrackType::Video,
            Frame::Audio(_) => TrackType::Audio,
            Frame::Subtitle(_) => TrackType::Subtitle,
        }
    }
}

/// 音频输出格式（交错 f32）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * std::mem::size_of::<f32>()
    }

    pub fn bytes_for_duration(&self, usecs: i64) -> usize {
        let frames = usecs.max(0) as u64 * self.sample_rate as u64 / 1_000_000;
        frames as usize * self.bytes_per_frame()
    }

    pub fn duration_for_bytes(&self, bytes: usize) -> i64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0;
        }
        let frames = (bytes / self.bytes_per_frame()) as i64;
        frames * 1_000_000 / self.sample_rate as i64
    }
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Closed,
    Opened,
    Playing,
    Paused,
}

/// 会话通知
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    DurationChanged(i64),
    PositionChanged(i64),
    TracksChanged,
    MetaDataChanged,
    SeekableChanged(bool),
    StateChanged(PlaybackState),
    Error { kind: ErrorKind, message: String },
    /// 切换轨道后重新同步到当前播放位置
    TrackResynced { track: TrackType, position: i64 },
    EndOfMedia,
}
