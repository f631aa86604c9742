use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 会话对外报告的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// 无法打开 / 访问媒体源或设备
    Resource,
    /// 不支持或损坏的容器 / 编解码器，缺少流信息
    Format,
    /// 没有权限打开媒体源
    AccessDenied,
    /// 网络错误（仅播放器会话使用）
    Network,
}

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("FFmpeg 错误: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("无法访问媒体源: {0}")]
    ResourceError(String),

    #[error("格式错误: {0}")]
    FormatError(String),

    #[error("没有访问权限: {0}")]
    AccessDenied(String),

    #[error("网络错误: {0}")]
    NetworkError(String),

    #[error("音频输出错误: {0}")]
    AudioError(String),

    #[error("配置错误: {0}")]
    ConfigError(#[from] serde_json::Error),
}

impl PlayerError {
    /// 打开容器失败时按 FFmpeg 错误码归类
    pub fn from_open_error(err: ffmpeg_next::Error, url: &str) -> Self {
        use ffmpeg_next::util::error::{EACCES, EINVAL};

        let message = format!("无法打开文件 {}: {}", url, err);
        match err {
            ffmpeg_next::Error::Other { errno } if errno == EACCES => {
                PlayerError::AccessDenied(message)
            }
            ffmpeg_next::Error::Other { errno } if errno == EINVAL => {
                PlayerError::FormatError(message)
            }
            ffmpeg_next::Error::InvalidData | ffmpeg_next::Error::StreamNotFound => {
                PlayerError::FormatError(message)
            }
            _ => PlayerError::ResourceError(message),
        }
    }

    /// 对外报告时使用的错误类别
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlayerError::AccessDenied(_) => ErrorKind::AccessDenied,
            PlayerError::NetworkError(_) => ErrorKind::Network,
            PlayerError::FormatError(_) | PlayerError::ConfigError(_) => ErrorKind::Format,
            PlayerError::FFmpegError(ffmpeg_next::Error::InvalidData)
            | PlayerError::FFmpegError(ffmpeg_next::Error::DecoderNotFound) => ErrorKind::Format,
            _ => ErrorKind::Resource,
        }
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;
