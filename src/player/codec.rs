use crate::core::{
    AudioFrame, Frame, Packet, PixelFormat, PlayerError, Result, StreamInfo, SubtitleFrame, TrackType,
    VideoFrame,
};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::util::error::EAGAIN;
use ffmpeg_next::{codec, format, software, util};
use log::{debug, info};

/// 从解码器取帧的结果
pub enum Received {
    Frame(Frame),
    /// 需要再送一个数据包
    NeedsInput,
    /// 排空完毕，不会再有帧
    EndOfStream,
}

/// 单个流的解码器
///
/// 打不开的流不会产生 `Codec`，所以拿到手的解码器总是可用的。
pub trait Codec: Send {
    fn kind(&self) -> TrackType;

    /// 送入一个数据包；流结束标记让解码器进入排空模式
    fn send_packet(&mut self, packet: &Packet) -> Result<()>;

    /// 取一帧。`Err` 表示硬错误，调用者应丢弃并继续。
    fn receive_frame(&mut self) -> Result<Received>;

    /// 字幕走单次调用路径：一个包解出零或一条字幕
    fn decode_subtitle(&mut self, _packet: &Packet) -> Result<Option<SubtitleFrame>> {
        Ok(None)
    }

    /// 丢弃内部缓冲的状态（seek 时使用）
    fn flush(&mut self);
}

/// 基于 FFmpeg 的解码器
pub struct FfmpegCodec {
    inner: DecoderType,
}

/// 解码器内部类型
enum DecoderType {
    Video(VideoDecoder),
    Audio(AudioDecoder),
    Subtitle(SubtitleDecoder),
}

// SwsContext / SwrContext 本身不是 Send，但每个解码器实例只会在它所属的解码线程中使用
unsafe impl Send for FfmpegCodec {}

impl FfmpegCodec {
    /// 为容器中的一个流打开解码器
    pub fn open(stream: format::stream::Stream, info: &StreamInfo) -> Result<Self> {
        let time_base = stream.time_base();
        let time_base = if time_base.denominator() != 0 {
            time_base.numerator() as f64 / time_base.denominator() as f64
        } else {
            0.0
        };

        let context = codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| invalid_media(info.index, e))?;
        let decoder = context.decoder();

        let inner = match info.kind {
            Some(TrackType::Video) => DecoderType::Video(VideoDecoder {
                decoder: decoder.video().map_err(|e| invalid_media(info.index, e))?,
                scaler: None,
                time_base,
                frame_duration: info.frame_duration().unwrap_or(0),
                next_pts: 0,
            }),
            Some(TrackType::Audio) => DecoderType::Audio(AudioDecoder {
                decoder: decoder.audio().map_err(|e| invalid_media(info.index, e))?,
                resampler: None,
                time_base,
                next_pts: 0,
            }),
            Some(TrackType::Subtitle) => DecoderType::Subtitle(SubtitleDecoder {
                decoder: decoder.subtitle().map_err(|e| invalid_media(info.index, e))?,
            }),
            None => {
                return Err(PlayerError::FormatError(format!(
                    "Invalid media file: 流 {} 不是可解码的类型",
                    info.index
                )))
            }
        };

        info!("✓ 解码器已打开: 流 {} ({}, {})", info.index, info.codec, kind_name(info.kind));
        Ok(Self { inner })
    }
}

fn invalid_media(index: usize, err: ffmpeg::Error) -> PlayerError {
    PlayerError::FormatError(format!("Invalid media file: 流 {} 无法打开解码器: {}", index, err))
}

fn kind_name(kind: Option<TrackType>) -> &'static str {
    kind.map(|k| k.as_str()).unwrap_or("unknown")
}

fn to_ms(ts: i64, time_base: f64) -> i64 {
    (ts as f64 * time_base * 1000.0) as i64
}

impl Codec for FfmpegCodec {
    fn kind(&self) -> TrackType {
        match self.inner {
            DecoderType::Video(_) => TrackType::Video,
            DecoderType::Audio(_) => TrackType::Audio,
            DecoderType::Subtitle(_) => TrackType::Subtitle,
        }
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let decoder: &mut codec::decoder::Opened = match &mut self.inner {
            DecoderType::Video(v) => &mut *v.decoder,
            DecoderType::Audio(a) => &mut *a.decoder,
            DecoderType::Subtitle(_) => return Ok(()),
        };

        let result = match packet.data() {
            Some(data) => decoder.send_packet(&data.raw),
            None => {
                debug!("解码器进入排空模式");
                decoder.send_eof()
            }
        };

        match result {
            Ok(()) | Err(ffmpeg::Error::Eof) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn receive_frame(&mut self) -> Result<Received> {
        match &mut self.inner {
            DecoderType::Video(v) => v.receive(),
            DecoderType::Audio(a) => a.receive(),
            DecoderType::Subtitle(_) => Ok(Received::NeedsInput),
        }
    }

    fn decode_subtitle(&mut self, packet: &Packet) -> Result<Option<SubtitleFrame>> {
        match &mut self.inner {
            DecoderType::Subtitle(s) => s.decode(packet),
            _ => Ok(None),
        }
    }

    fn flush(&mut self) {
        match &mut self.inner {
            DecoderType::Video(v) => v.decoder.flush(),
            DecoderType::Audio(a) => a.decoder.flush(),
            DecoderType::Subtitle(s) => s.decoder.flush(),
        }
    }
}

/// 把 receive_frame 的错误码映射为取帧结果
fn classify(result: std::result::Result<(), ffmpeg::Error>) -> Result<Option<Received>> {
    match result {
        Ok(()) => Ok(None),
        Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => Ok(Some(Received::NeedsInput)),
        Err(ffmpeg::Error::Eof) => Ok(Some(Received::EndOfStream)),
        Err(e) => Err(e.into()),
    }
}

// ============= 视频 =============

struct VideoDecoder {
    decoder: codec::decoder::Video,
    scaler: Option<(software::scaling::Context, util::format::Pixel, u32, u32)>,
    time_base: f64,
    frame_duration: i64,
    next_pts: i64,
}

impl VideoDecoder {
    fn receive(&mut self) -> Result<Received> {
        let mut decoded = util::frame::Video::empty();
        if let Some(state) = classify(self.decoder.receive_frame(&mut decoded))? {
            return Ok(state);
        }
        Ok(Received::Frame(Frame::Video(self.convert_frame(&decoded)?)))
    }

    /// 转换帧格式为 RGBA
    fn convert_frame(&mut self, frame: &util::frame::Video) -> Result<VideoFrame> {
        let width = frame.width();
        let height = frame.height();
        let format = frame.format();

        // 分辨率或像素格式变化时重建 scaler
        let stale = match &self.scaler {
            Some((_, f, w, h)) => *f != format || *w != width || *h != height,
            None => true,
        };
        if stale {
            debug!("🔧 创建 scaler: {:?} {}x{} → RGBA", format, width, height);
            let context = software::scaling::Context::get(
                format,
                width,
                height,
                util::format::Pixel::RGBA,
                width,
                height,
                software::scaling::Flags::BILINEAR,
            )?;
            self.scaler = Some((context, format, width, height));
        }

        let mut rgba_frame = util::frame::Video::empty();
        if let Some((scaler, ..)) = self.scaler.as_mut() {
            scaler.run(frame, &mut rgba_frame)?;
        }

        let pts = frame
            .pts()
            .or_else(|| frame.timestamp())
            .map(|ts| to_ms(ts, self.time_base))
            .unwrap_or(self.next_pts);
        self.next_pts = pts + self.frame_duration;

        // 复制数据到连续内存
        let row_size = width as usize * 4;
        let stride = rgba_frame.stride(0);
        let frame_data = rgba_frame.data(0);
        let mut data = vec![0u8; row_size * height as usize];
        for (y, row) in data.chunks_exact_mut(row_size).enumerate() {
            let src_offset = y * stride;
            row.copy_from_slice(&frame_data[src_offset..src_offset + row_size]);
        }

        Ok(VideoFrame {
            pts,
            duration: self.frame_duration,
            width,
            height,
            format: PixelFormat::RGBA,
            data: data.into(),
        })
    }
}

// ============= 音频 =============

struct AudioDecoder {
    decoder: codec::decoder::Audio,
    resampler: Option<(software::resampling::Context, util::format::Sample, util::channel_layout::ChannelLayout, u32)>,
    time_base: f64,
    next_pts: i64,
}

impl AudioDecoder {
    fn receive(&mut self) -> Result<Received> {
        let mut decoded = util::frame::Audio::empty();
        if let Some(state) = classify(self.decoder.receive_frame(&mut decoded))? {
            return Ok(state);
        }
        Ok(Received::Frame(Frame::Audio(self.convert_frame(&decoded)?)))
    }

    /// 转换为交错 f32，保持原始采样率和声道布局
    fn convert_frame(&mut self, frame: &util::frame::Audio) -> Result<AudioFrame> {
        let rate = frame.rate();
        let format = frame.format();
        let layout = if frame.channel_layout().is_empty() {
            util::channel_layout::ChannelLayout::default(frame.channels() as i32)
        } else {
            frame.channel_layout()
        };

        let stale = match &self.resampler {
            Some((_, f, l, r)) => *f != format || *l != layout || *r != rate,
            None => true,
        };
        if stale {
            debug!("🔧 创建音频转换器: {:?} {}Hz/{}ch → f32 packed", format, rate, layout.channels());
            let context = software::resampling::Context::get(
                format,
                layout,
                rate,
                util::format::Sample::F32(util::format::sample::Type::Packed),
                layout,
                rate,
            )?;
            self.resampler = Some((context, format, layout, rate));
        }

        let mut converted = util::frame::Audio::empty();
        if let Some((resampler, ..)) = self.resampler.as_mut() {
            resampler.run(frame, &mut converted)?;
        }

        let channels = layout.channels().max(1) as u16;
        let len = converted.samples() * channels as usize;
        let bytes = &converted.data(0)[..len * std::mem::size_of::<f32>()];
        let data: Vec<f32> = match bytemuck::try_cast_slice::<u8, f32>(bytes) {
            Ok(samples) => samples.to_vec(),
            Err(_) => bytes
                .chunks_exact(4)
                .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        };

        let pts = frame
            .pts()
            .or_else(|| frame.timestamp())
            .map(|ts| to_ms(ts, self.time_base))
            .unwrap_or(self.next_pts);

        let audio = AudioFrame {
            pts,
            sample_rate: rate,
            channels,
            data,
        };
        self.next_pts = pts + audio.duration();
        Ok(audio)
    }
}

// ============= 字幕 =============

struct SubtitleDecoder {
    decoder: codec::decoder::Subtitle,
}

/// 字幕区域的文本内容
#[derive(Debug, Clone, PartialEq)]
pub enum SubtitleRect {
    Text(String),
    Ass(String),
    Bitmap,
}

impl SubtitleDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Option<SubtitleFrame>> {
        let Some(data) = packet.data() else {
            return Ok(None);
        };

        let mut subtitle = codec::subtitle::Subtitle::new();
        let decoded = self.decoder.decode(&data.raw, &mut subtitle);

        let frame = match decoded {
            Ok(true) => {
                // 字幕自带的时间戳不一定有，没有就用数据包的
                let (start, end) = match subtitle.pts() {
                    Some(pts) => {
                        let base = pts / 1000;
                        (base + subtitle.start() as i64, base + subtitle.end() as i64)
                    }
                    None => {
                        let start = data.pts.unwrap_or(0);
                        (start, start + data.duration)
                    }
                };

                let rects: Vec<SubtitleRect> = subtitle
                    .rects()
                    .map(|rect| match rect {
                        codec::subtitle::Rect::Text(text) => SubtitleRect::Text(text.get().to_string()),
                        codec::subtitle::Rect::Ass(ass) => SubtitleRect::Ass(ass.get().to_string()),
                        _ => SubtitleRect::Bitmap,
                    })
                    .collect();

                Ok(Some(SubtitleFrame {
                    pts: start,
                    end_pts: end.max(start),
                    text: subtitle_text(&rects),
                }))
            }
            Ok(false) => Ok(None),
            Err(e) => Err(e.into()),
        };

        // ✅ 必须释放 FFmpeg subtitle，否则泄漏
        unsafe {
            ffmpeg_next::ffi::avsubtitle_free(subtitle.as_mut_ptr());
        }

        frame
    }
}

/// 拼接字幕区域为显示文本
pub fn subtitle_text(rects: &[SubtitleRect]) -> String {
    let mut text = String::new();
    for (i, rect) in rects.iter().enumerate() {
        if i > 0 {
            text.push('\n');
        }
        match rect {
            SubtitleRect::Text(s) => text.push_str(s),
            SubtitleRect::Ass(s) => text.push_str(&strip_ass_tags(ass_dialogue_text(s))),
            SubtitleRect::Bitmap => {}
        }
    }

    let mut text = text
        .replace("\\N", "\n")
        .replace("\\n", "\n")
        .replace("\r\n", "\n");
    if text.ends_with('\n') {
        text.pop();
    }
    text
}

/// ASS 事件行前 9 个字段是时间、样式等，正文在第 9 个逗号之后
fn ass_dialogue_text(line: &str) -> &str {
    let mut commas = 0;
    for (i, ch) in line.char_indices() {
        if commas == 9 {
            return &line[i..];
        }
        if ch == ',' {
            commas += 1;
        }
    }
    ""
}

/// 去掉 `{\an8}`、`{\pos(..)}` 这类覆盖标签
fn strip_ass_tags(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut depth = 0usize;
    for ch in text.chars() {
        match ch {
            '{' => depth += 1,
            '}' if depth > 0 => depth -= 1,
            _ if depth > 0 => {}
            _ => result.push(ch),
        }
    }
    result
}
