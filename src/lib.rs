//! 多线程媒体播放引擎
//!
//! 一个 [`player::Decoder`] 会话由三类工作线程组成：Demuxer 读包并分发，
//! 每个流一个解码线程，视频 / 音频各一个渲染线程按共享时钟送帧。
//! 宿主通过 [`output::VideoSink`] 和 [`output::AudioOutput`] 接收输出。

pub mod core;
pub mod output;
pub mod player;

pub use crate::core::{EngineConfig, PlaybackState, PlayerError, PlayerEvent, Result, TrackType};
pub use crate::player::Decoder;
