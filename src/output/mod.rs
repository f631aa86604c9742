// 输出端抽象：视频画面 / 字幕文本的接收者和音频设备

pub mod audio_output;

pub use audio_output::CpalOutput;

use crate::core::{AudioFormat, Result, VideoFrame};

/// 视频帧和字幕文本的接收者（由宿主实现）
///
/// 渲染线程调用；`None` 表示清空。
pub trait VideoSink: Send + Sync {
    fn set_video_frame(&self, frame: Option<VideoFrame>);
    fn set_subtitle_text(&self, text: Option<String>);
}

/// 可以打开音频流的设备
pub trait AudioOutput: Send + Sync {
    /// 按请求的格式打开；设备可能选用别的格式，以 `AudioStream::format` 为准
    fn open(&self, requested: AudioFormat, buffer_usecs: i64) -> Result<Box<dyn AudioStream>>;
}

/// 已打开的音频流（交错 f32）
pub trait AudioStream: Send {
    fn format(&self) -> AudioFormat;

    /// 写入采样，返回被接受的采样数（设备缓冲区满时可能少于输入）
    fn write(&mut self, samples: &[f32]) -> usize;

    /// 设备缓冲区大小（字节）
    fn buffer_size(&self) -> usize;

    /// 设备已经播放掉的时长（微秒）
    fn processed_usecs(&self) -> i64;

    /// 丢弃缓冲区并把计数清零
    fn reset(&mut self);
}
