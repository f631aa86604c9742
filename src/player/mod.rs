// 播放器核心：解封装 → 流解码 → 渲染，每一级一个工作线程

pub mod codec;
pub mod decoder;
pub mod demuxer;
pub mod demuxer_source;
pub mod ffmpeg_source;
pub mod renderer;
pub mod stream_decoder;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use codec::{Codec, FfmpegCodec, Received};
pub use decoder::Decoder;
pub use demuxer::Demuxer;
pub use demuxer_source::DemuxerSource;
pub use ffmpeg_source::{is_network_url, FfmpegSource};
pub use renderer::{Converter, Renderer};
pub use stream_decoder::{StreamDecoder, StreamHandle};
