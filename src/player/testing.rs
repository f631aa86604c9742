// 测试用的内存数据源、假解码器和可观察的输出

use crate::core::{
    AudioFormat, AudioFrame, Frame, MediaMetaData, Packet, PixelFormat, PlayerError, Result, StreamInfo,
    SubtitleFrame, TrackType, VideoFrame,
};
use crate::output::{AudioOutput, AudioStream, VideoSink};
use crate::player::codec::{Codec, Received};
use crate::player::demuxer_source::DemuxerSource;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub fn below(&mut self, n: u64) -> u64 {
        self.next_u64() % n.max(1)
    }
}

pub fn packet(stream: usize, size: usize, pts: i64, duration: i64) -> Packet {
    Packet::new(ffmpeg_next::Packet::new(size), stream, Some(pts), duration)
}

/// 轮询直到条件成立或超时
pub fn wait_until(timeout_ms: u64, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

pub fn video_frame(pts: i64, duration: i64) -> VideoFrame {
    VideoFrame {
        pts,
        duration,
        width: 2,
        height: 2,
        format: PixelFormat::RGBA,
        data: Arc::from(vec![0u8; 16]),
    }
}

pub const FAKE_SAMPLE_RATE: u32 = 8000;

pub fn audio_frame(pts: i64, duration: i64) -> AudioFrame {
    let samples = (duration.max(0) as usize) * FAKE_SAMPLE_RATE as usize / 1000;
    AudioFrame {
        pts,
        sample_rate: FAKE_SAMPLE_RATE,
        channels: 2,
        data: vec![0.25; samples * 2],
    }
}

/// 每个数据包解出一帧的解码器
pub struct FakeCodec {
    kind: TrackType,
    pending: VecDeque<Frame>,
    draining: bool,
}

impl FakeCodec {
    pub fn new(kind: TrackType) -> Self {
        Self {
            kind,
            pending: VecDeque::new(),
            draining: false,
        }
    }
}

impl Codec for FakeCodec {
    fn kind(&self) -> TrackType {
        self.kind
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        if packet.is_end_of_stream() {
            self.draining = true;
            return Ok(());
        }
        let pts = packet.pts().unwrap_or(0);
        let duration = packet.duration();
        let frame = match self.kind {
            TrackType::Video => Frame::Video(video_frame(pts, duration)),
            TrackType::Audio => Frame::Audio(audio_frame(pts, duration)),
            TrackType::Subtitle => Frame::Subtitle(SubtitleFrame {
                pts,
                end_pts: pts + duration,
                text: format!("line {}", pts),
            }),
        };
        self.pending.push_back(frame);
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Received> {
        Ok(match self.pending.pop_front() {
            Some(frame) => Received::Frame(frame),
            None if self.draining => Received::EndOfStream,
            None => Received::NeedsInput,
        })
    }

    fn decode_subtitle(&mut self, packet: &Packet) -> Result<Option<SubtitleFrame>> {
        let pts = packet.pts().unwrap_or(0);
        Ok(Some(SubtitleFrame {
            pts,
            end_pts: pts + packet.duration(),
            text: format!("line {}", pts),
        }))
    }

    fn flush(&mut self) {
        self.pending.clear();
        self.draining = false;
    }
}

struct FakePacket {
    stream: usize,
    pts: i64,
    duration: i64,
    size: usize,
    keyframe: bool,
}

/// 按时间戳交错排列的内存容器
pub struct FakeSource {
    streams: Vec<StreamInfo>,
    packets: Vec<FakePacket>,
    position: usize,
    discard: Arc<Mutex<Vec<bool>>>,
    unopenable: Vec<usize>,
    seekable: bool,
}

pub struct FakeSourceBuilder {
    duration: i64,
    streams: Vec<StreamInfo>,
    packets: Vec<FakePacket>,
    unopenable: Vec<usize>,
    seekable: bool,
}

impl FakeSource {
    pub fn builder(duration: i64) -> FakeSourceBuilder {
        FakeSourceBuilder {
            duration,
            streams: Vec::new(),
            packets: Vec::new(),
            unopenable: Vec::new(),
            seekable: true,
        }
    }

    /// 与 Demuxer 共享的丢弃标志（true = 丢弃）
    pub fn discard_flags(&self) -> Arc<Mutex<Vec<bool>>> {
        self.discard.clone()
    }
}

impl FakeSourceBuilder {
    fn push_stream(&mut self, mut info: StreamInfo) -> usize {
        let index = self.streams.len();
        info.index = index;
        info.duration = self.duration;
        self.streams.push(info);
        index
    }

    pub fn video(mut self, frame_ms: i64, gop_ms: i64) -> Self {
        let index = self.push_stream(StreamInfo {
            kind: Some(TrackType::Video),
            codec: "fake-video".to_string(),
            frame_rate: Some((1000, frame_ms as i32)),
            width: 2,
            height: 2,
            ..Default::default()
        });
        let mut pts = 0;
        while pts < self.duration {
            self.packets.push(FakePacket {
                stream: index,
                pts,
                duration: frame_ms,
                size: 1000,
                keyframe: pts % gop_ms == 0,
            });
            pts += frame_ms;
        }
        self
    }

    pub fn audio(mut self, packet_ms: i64) -> Self {
        let index = self.push_stream(StreamInfo {
            kind: Some(TrackType::Audio),
            codec: "fake-audio".to_string(),
            sample_rate: FAKE_SAMPLE_RATE,
            channels: 2,
            ..Default::default()
        });
        let mut pts = 0;
        while pts < self.duration {
            self.packets.push(FakePacket {
                stream: index,
                pts,
                duration: packet_ms,
                size: 200,
                keyframe: true,
            });
            pts += packet_ms;
        }
        self
    }

    pub fn subtitle(mut self, interval_ms: i64, duration_ms: i64) -> Self {
        let index = self.push_stream(StreamInfo {
            kind: Some(TrackType::Subtitle),
            codec: "fake-text".to_string(),
            language: Some("eng".to_string()),
            ..Default::default()
        });
        let mut pts = interval_ms / 2;
        while pts < self.duration {
            self.packets.push(FakePacket {
                stream: index,
                pts,
                duration: duration_ms,
                size: 40,
                keyframe: true,
            });
            pts += interval_ms;
        }
        self
    }

    /// 标记为容器默认流
    pub fn default_stream(mut self, index: usize) -> Self {
        if let Some(info) = self.streams.get_mut(index) {
            info.is_default = true;
        }
        self
    }

    /// 打开解码器会失败的流
    pub fn unopenable(mut self, index: usize) -> Self {
        self.unopenable.push(index);
        self
    }

    pub fn unseekable(mut self) -> Self {
        self.seekable = false;
        self
    }

    pub fn build(mut self) -> FakeSource {
        self.packets.sort_by_key(|p| (p.pts, p.stream));
        let count = self.streams.len();
        FakeSource {
            streams: self.streams,
            packets: self.packets,
            position: 0,
            discard: Arc::new(Mutex::new(vec![true; count])),
            unopenable: self.unopenable,
            seekable: self.seekable,
        }
    }
}

impl DemuxerSource for FakeSource {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let discard = self.discard.lock();
        while let Some(p) = self.packets.get(self.position) {
            self.position += 1;
            if discard.get(p.stream).copied().unwrap_or(true) {
                continue;
            }
            return Ok(Some(packet(p.stream, p.size, p.pts, p.duration)));
        }
        Ok(None)
    }

    fn seek(&mut self, position_ms: i64) -> Result<()> {
        let video = self
            .streams
            .iter()
            .position(|s| s.kind == Some(TrackType::Video));
        let target = self
            .packets
            .iter()
            .filter(|p| video.map_or(true, |v| p.stream == v && p.keyframe) && p.pts <= position_ms)
            .map(|p| p.pts)
            .last()
            .unwrap_or(0);
        self.position = self
            .packets
            .iter()
            .position(|p| p.pts >= target)
            .unwrap_or(self.packets.len());
        Ok(())
    }

    fn set_discard(&mut self, stream_index: usize, discard: bool) {
        if let Some(flag) = self.discard.lock().get_mut(stream_index) {
            *flag = discard;
        }
    }

    fn open_codec(&self, stream_index: usize) -> Result<Box<dyn Codec>> {
        let kind = self
            .streams
            .get(stream_index)
            .and_then(|s| s.kind)
            .ok_or_else(|| PlayerError::FormatError(format!("Invalid media file: 没有流 {}", stream_index)))?;
        if self.unopenable.contains(&stream_index) {
            return Err(PlayerError::FormatError(format!(
                "Invalid media file: 流 {} 的解码器不可用",
                stream_index
            )));
        }
        Ok(Box::new(FakeCodec::new(kind)))
    }

    fn is_seekable(&self) -> bool {
        self.seekable
    }

    fn metadata(&self) -> MediaMetaData {
        let mut metadata = MediaMetaData {
            format: "fake".to_string(),
            ..Default::default()
        };
        metadata.tags.insert("title".to_string(), "test pattern".to_string());
        metadata
    }

    fn description(&self) -> String {
        format!("FakeSource: {} 个流, {} 个包", self.streams.len(), self.packets.len())
    }
}

/// 记录收到的画面和字幕
#[derive(Default)]
pub struct RecordingVideoSink {
    frames: Mutex<Vec<i64>>,
    subtitles: Mutex<Vec<Option<String>>>,
    clears: Mutex<usize>,
}

impl RecordingVideoSink {
    pub fn frames(&self) -> Vec<i64> {
        self.frames.lock().clone()
    }

    pub fn subtitles(&self) -> Vec<Option<String>> {
        self.subtitles.lock().clone()
    }

    pub fn clears(&self) -> usize {
        *self.clears.lock()
    }
}

impl VideoSink for RecordingVideoSink {
    fn set_video_frame(&self, frame: Option<VideoFrame>) {
        match frame {
            Some(frame) => self.frames.lock().push(frame.pts),
            None => *self.clears.lock() += 1,
        }
    }

    fn set_subtitle_text(&self, text: Option<String>) {
        self.subtitles.lock().push(text);
    }
}

/// 按墙钟消费的假音频设备
pub struct FakeAudioOutput {
    opened: Mutex<Vec<AudioFormat>>,
    samples: Arc<Mutex<Vec<f32>>>,
    fail: bool,
}

impl FakeAudioOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            opened: Mutex::new(Vec::new()),
            samples: Arc::new(Mutex::new(Vec::new())),
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            opened: Mutex::new(Vec::new()),
            samples: Arc::new(Mutex::new(Vec::new())),
            fail: true,
        })
    }

    pub fn opened(&self) -> Vec<AudioFormat> {
        self.opened.lock().clone()
    }

    /// 所有写入过的采样
    pub fn samples(&self) -> Vec<f32> {
        self.samples.lock().clone()
    }
}

impl AudioOutput for FakeAudioOutput {
    fn open(&self, requested: AudioFormat, buffer_usecs: i64) -> Result<Box<dyn AudioStream>> {
        if self.fail {
            return Err(PlayerError::AudioError("没有音频设备".to_string()));
        }
        self.opened.lock().push(requested);
        let capacity_frames = (requested.bytes_for_duration(buffer_usecs) / requested.bytes_per_frame()).max(1);
        Ok(Box::new(FakeAudioStream {
            format: requested,
            capacity_frames: capacity_frames as u64,
            written_frames: 0,
            processed_frames: 0,
            last_update: Instant::now(),
            samples: self.samples.clone(),
        }))
    }
}

struct FakeAudioStream {
    format: AudioFormat,
    capacity_frames: u64,
    written_frames: u64,
    processed_frames: u64,
    last_update: Instant,
    samples: Arc<Mutex<Vec<f32>>>,
}

impl FakeAudioStream {
    // 设备按墙钟消费，但不会消费还没写入的数据（欠载的时间丢掉）
    fn advance(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update);
        let frames = (elapsed.as_micros() as u64) * self.format.sample_rate as u64 / 1_000_000;
        if frames > 0 {
            self.processed_frames = (self.processed_frames + frames).min(self.written_frames);
            self.last_update = now;
        }
    }
}

impl AudioStream for FakeAudioStream {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn write(&mut self, samples: &[f32]) -> usize {
        self.advance();
        if self.written_frames == self.processed_frames {
            self.last_update = Instant::now();
        }
        let channels = self.format.channels.max(1) as usize;
        let queued = self.written_frames - self.processed_frames;
        let space = self.capacity_frames.saturating_sub(queued) as usize;
        let frames = (samples.len() / channels).min(space);
        self.written_frames += frames as u64;
        self.samples.lock().extend_from_slice(&samples[..frames * channels]);
        frames * channels
    }

    fn buffer_size(&self) -> usize {
        self.capacity_frames as usize * self.format.bytes_per_frame()
    }

    fn processed_usecs(&self) -> i64 {
        let elapsed = self.last_update.elapsed();
        let extra = (elapsed.as_micros() as u64) * self.format.sample_rate as u64 / 1_000_000;
        let frames = (self.processed_frames + extra).min(self.written_frames);
        (frames * 1_000_000 / self.format.sample_rate.max(1) as u64) as i64
    }

    fn reset(&mut self) {
        self.written_frames = 0;
        self.processed_frames = 0;
        self.last_update = Instant::now();
    }
}
