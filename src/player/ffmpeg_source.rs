use crate::core::{MediaMetaData, Packet, PlayerError, Result, StreamInfo, TrackType};
use crate::player::codec::{Codec, FfmpegCodec};
use crate::player::demuxer_source::DemuxerSource;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{format, media};
use log::{debug, info, warn};
use std::collections::BTreeMap;

/// 基于 FFmpeg 的容器数据源
pub struct FfmpegSource {
    input: format::context::Input,
    streams: Vec<StreamInfo>,
    time_bases: Vec<f64>,
    source_path: String,
}

// AVFormatContext 只会在 Demuxer 线程里访问（外部调用都经过 Demuxer 的锁）
unsafe impl Send for FfmpegSource {}

/// 判断是否为网络流
pub fn is_network_url(path: &str) -> bool {
    path.starts_with("http://")
        || path.starts_with("https://")
        || path.starts_with("rtsp://")
        || path.starts_with("rtmp://")
        || path.contains(".m3u8")
}

/// 网络流的打开选项
fn network_options(path: &str) -> ffmpeg::Dictionary<'static> {
    let mut options = ffmpeg::Dictionary::new();

    // discardcorrupt: 丢弃损坏的帧；genpts: 生成缺失的 PTS
    options.set("fflags", "+discardcorrupt+genpts");
    options.set("analyzeduration", "5000000");
    options.set("probesize", "10000000");

    // 网络超时与重连
    options.set("timeout", "15000000");
    options.set("rw_timeout", "8000000");
    options.set("buffer_size", "8388608");
    options.set("reconnect", "1");
    options.set("reconnect_streamed", "1");
    options.set("reconnect_delay_max", "4");

    if path.contains(".m3u8") {
        info!("🎬 HLS 流检测，应用 HLS 选项");
        options.set("max_reload", "10");
        options.set("http_persistent", "1");
    }
    options
}

impl FfmpegSource {
    /// 打开媒体文件或网络流
    pub fn open(path: &str) -> Result<Self> {
        ffmpeg::init()?;
        info!("正在打开: {}", path);

        let input = if is_network_url(path) {
            info!("🌐 检测到网络流，应用网络选项");
            format::input_with_dictionary(&path, network_options(path))
        } else {
            format::input(&path)
        }
        .map_err(|e| match PlayerError::from_open_error(e, path) {
            PlayerError::ResourceError(message) if is_network_url(path) => PlayerError::NetworkError(message),
            other => other,
        })?;

        let streams: Vec<StreamInfo> = input.streams().map(|s| stream_info(&s)).collect();
        let time_bases = input
            .streams()
            .map(|s| {
                let tb = s.time_base();
                if tb.denominator() != 0 {
                    tb.numerator() as f64 / tb.denominator() as f64
                } else {
                    0.0
                }
            })
            .collect();

        if streams.iter().all(|s| s.kind.is_none()) {
            return Err(PlayerError::FormatError(format!("{} 中没有可播放的流", path)));
        }

        for s in &streams {
            debug!("流 {}: {:?} {} default={}", s.index, s.kind, s.codec, s.is_default);
        }

        let mut source = Self {
            input,
            streams,
            time_bases,
            source_path: path.to_string(),
        };

        // 初始全部丢弃，由 Demuxer 按已安装的流打开
        for index in 0..source.streams.len() {
            source.set_discard(index, true);
        }
        Ok(source)
    }

    fn to_ms(&self, stream_index: usize, ts: i64) -> i64 {
        let tb = self.time_bases.get(stream_index).copied().unwrap_or(0.0);
        (ts as f64 * tb * 1000.0) as i64
    }
}

/// 提取单个流的描述
fn stream_info(stream: &format::stream::Stream) -> StreamInfo {
    let params = stream.parameters();
    let kind = match params.medium() {
        media::Type::Video => Some(TrackType::Video),
        media::Type::Audio => Some(TrackType::Audio),
        media::Type::Subtitle => Some(TrackType::Subtitle),
        _ => None,
    };

    let tb = stream.time_base();
    let duration = if stream.duration() > 0 && tb.denominator() != 0 {
        stream.duration() * 1000 * tb.numerator() as i64 / tb.denominator() as i64
    } else {
        0
    };

    let (bit_rate, width, height, sample_rate, channels) = unsafe {
        let p = params.as_ptr();
        (
            (*p).bit_rate,
            (*p).width.max(0) as u32,
            (*p).height.max(0) as u32,
            (*p).sample_rate.max(0) as u32,
            (*p).channels.max(0) as u16,
        )
    };

    let rate = stream.avg_frame_rate();
    let frame_rate = match kind {
        Some(TrackType::Video) if rate.numerator() > 0 && rate.denominator() > 0 => {
            Some((rate.numerator(), rate.denominator()))
        }
        _ => None,
    };

    StreamInfo {
        index: stream.index(),
        kind,
        is_default: stream.disposition().contains(format::stream::Disposition::DEFAULT),
        duration,
        codec: params.id().name().to_string(),
        bit_rate,
        language: stream.metadata().get("language").map(str::to_string),
        frame_rate,
        width,
        height,
        sample_rate,
        channels,
    }
}

impl DemuxerSource for FfmpegSource {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let mut raw = ffmpeg::Packet::empty();
        match raw.read(&mut self.input) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let stream_index = raw.stream();
        let pts = raw.pts().map(|ts| self.to_ms(stream_index, ts));
        let duration = self.to_ms(stream_index, raw.duration());
        Ok(Some(Packet::new(raw, stream_index, pts, duration)))
    }

    fn seek(&mut self, position_ms: i64) -> Result<()> {
        let timestamp = position_ms.max(0) * 1000; // 毫秒转微秒
        self.input.seek(timestamp, ..timestamp)?;
        Ok(())
    }

    fn set_discard(&mut self, stream_index: usize, discard: bool) {
        if stream_index >= self.streams.len() {
            warn!("set_discard: 流索引越界 {}", stream_index);
            return;
        }
        unsafe {
            let ctx = self.input.as_mut_ptr();
            let stream = *(*ctx).streams.add(stream_index);
            (*stream).discard = if discard {
                ffmpeg::ffi::AVDiscard::AVDISCARD_ALL
            } else {
                ffmpeg::ffi::AVDiscard::AVDISCARD_DEFAULT
            };
        }
    }

    fn open_codec(&self, stream_index: usize) -> Result<Box<dyn Codec>> {
        let info = self
            .streams
            .get(stream_index)
            .ok_or_else(|| PlayerError::FormatError(format!("Invalid media file: 没有流 {}", stream_index)))?;
        let stream = self
            .input
            .stream(stream_index)
            .ok_or_else(|| PlayerError::FormatError(format!("Invalid media file: 没有流 {}", stream_index)))?;
        Ok(Box::new(FfmpegCodec::open(stream, info)?))
    }

    fn is_seekable(&self) -> bool {
        unsafe {
            let flags = (*self.input.as_ptr()).ctx_flags;
            flags & ffmpeg::ffi::AVFMTCTX_UNSEEKABLE as i32 == 0
        }
    }

    fn duration(&self) -> i64 {
        let duration = self.input.duration();
        if duration > 0 {
            duration / 1000 // 微秒转毫秒
        } else {
            self.streams.iter().map(|s| s.duration).max().unwrap_or(0)
        }
    }

    fn metadata(&self) -> MediaMetaData {
        let tags: BTreeMap<String, String> = self
            .input
            .metadata()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        MediaMetaData {
            format: self.input.format().name().to_string(),
            tags,
        }
    }

    fn description(&self) -> String {
        format!("FFmpeg Demuxer: {}", self.source_path)
    }
}
