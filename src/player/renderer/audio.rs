use crate::core::{AudioFormat, AudioFrame, ClockController, ClockId, ClockSnapshot, Frame, PlayerEvent, Result};
use crate::output::{AudioOutput, AudioStream};
use crate::player::stream_decoder::StreamHandle;
use crossbeam_channel::Sender;
use ffmpeg_next::{software, util};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

fn layout(channels: u16) -> util::channel_layout::ChannelLayout {
    util::channel_layout::ChannelLayout::default(channels.max(1) as i32)
}

const F32_PACKED: util::format::Sample = util::format::Sample::F32(util::format::sample::Type::Packed);

/// 解码输出 → 设备格式的转换（采样率 / 声道 / 变速）
///
/// 输出采样率是 `设备采样率 / 播放速率`，设备按原速消费，于是播放速度随之改变。
/// 格式完全一致时直接透传。
pub struct Converter {
    in_rate: u32,
    in_channels: u16,
    out_rate: u32,
    out_channels: u16,
    resampler: Option<software::resampling::Context>,
}

// SwrContext 只在音频渲染线程中使用
unsafe impl Send for Converter {}

impl Converter {
    pub fn new(in_rate: u32, in_channels: u16, output: AudioFormat, playback_rate: f64) -> Result<Self> {
        let out_rate = ((output.sample_rate as f64 / playback_rate.max(0.01)).round() as u32).max(1);
        let resampler = if in_rate == out_rate && in_channels == output.channels {
            None
        } else {
            debug!(
                "🔧 音频转换: {}Hz/{}ch → {}Hz/{}ch (速率 {})",
                in_rate, in_channels, out_rate, output.channels, playback_rate
            );
            Some(software::resampling::Context::get(
                F32_PACKED,
                layout(in_channels),
                in_rate,
                F32_PACKED,
                layout(output.channels),
                out_rate,
            )?)
        };

        Ok(Self {
            in_rate,
            in_channels,
            out_rate,
            out_channels: output.channels,
            resampler,
        })
    }

    #[cfg(test)]
    fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    pub fn matches(&self, frame: &AudioFrame) -> bool {
        self.in_rate == frame.sample_rate && self.in_channels == frame.channels
    }

    /// 转换一帧，返回交错 f32 采样
    pub fn convert(&mut self, frame: &AudioFrame) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(frame.data.clone());
        };

        let samples = frame.samples();
        let mut input = util::frame::Audio::new(F32_PACKED, samples, layout(self.in_channels));
        input.set_rate(self.in_rate);
        let bytes: &[u8] = bytemuck::cast_slice(&frame.data[..samples * self.in_channels as usize]);
        input.data_mut(0)[..bytes.len()].copy_from_slice(bytes);

        let capacity = samples * self.out_rate as usize / self.in_rate.max(1) as usize + 64;
        let mut output = util::frame::Audio::new(F32_PACKED, capacity, layout(self.out_channels));
        output.set_rate(self.out_rate);
        resampler.run(&input, &mut output)?;

        let len = output.samples() * self.out_channels as usize;
        let bytes = &output.data(0)[..len * std::mem::size_of::<f32>()];
        Ok(match bytemuck::try_cast_slice::<u8, f32>(bytes) {
            Ok(samples) => samples.to_vec(),
            Err(_) => bytes
                .chunks_exact(4)
                .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        })
    }
}

pub(super) struct AudioState {
    output: Arc<dyn AudioOutput>,
    sink: Option<Box<dyn AudioStream>>,
    converter: Option<Converter>,
    pending: Vec<f32>,              // 设备没写完的尾巴
    pending_offset: usize,
    written_usecs: i64,
    processed_usecs: i64,
    latency_usecs: i64,
    audio_base: i64,                // 本段播放起点对应的会话时间
    processed_base: i64,
    muted: bool,
    device_changed: bool,
    open_failed: bool,
    resumes: u64,
    epoch: Option<u64>,
    rate: f64,
    buffer_usecs: i64,
    events: Sender<PlayerEvent>,
}

impl AudioState {
    pub(super) fn new(output: Arc<dyn AudioOutput>, buffer_usecs: i64, events: Sender<PlayerEvent>) -> Self {
        Self {
            output,
            sink: None,
            converter: None,
            pending: Vec::new(),
            pending_offset: 0,
            written_usecs: 0,
            processed_usecs: 0,
            latency_usecs: 0,
            audio_base: 0,
            processed_base: 0,
            muted: false,
            device_changed: false,
            open_failed: false,
            resumes: 0,
            epoch: None,
            rate: 1.0,
            buffer_usecs,
            events,
        }
    }

    pub(super) fn device_changed(&mut self) {
        self.device_changed = true;
    }

    pub(super) fn set_output(&mut self, output: Arc<dyn AudioOutput>) {
        self.output = output;
        self.device_changed = true;
    }

    fn clear_pending(&mut self) {
        self.pending.clear();
        self.pending_offset = 0;
    }

    /// 关闭设备并清零计时
    pub(super) fn free_output(&mut self, current_time: i64) {
        if let Some(mut sink) = self.sink.take() {
            sink.reset();
        }
        self.converter = None;
        self.muted = false;
        self.open_failed = false;
        self.clear_pending();
        self.audio_base = current_time;
        self.processed_base = 0;
        self.processed_usecs = 0;
        self.written_usecs = 0;
    }

    fn update_output(&mut self, frame: &AudioFrame, rate: f64) {
        let requested = AudioFormat {
            sample_rate: frame.sample_rate,
            channels: frame.channels,
        };
        let result = self
            .output
            .open(requested, self.buffer_usecs)
            .and_then(|sink| {
                let converter = Converter::new(frame.sample_rate, frame.channels, sink.format(), rate)?;
                Ok((sink, converter))
            });

        match result {
            Ok((sink, converter)) => {
                let format = sink.format();
                self.latency_usecs = format.duration_for_bytes(sink.buffer_size());
                self.muted = rate < 0.5 || rate > 2.0;
                info!(
                    "🔊 音频输出已打开: {} Hz, {} 声道, 延迟 {} µs{}",
                    format.sample_rate,
                    format.channels,
                    self.latency_usecs,
                    if self.muted { " (静音)" } else { "" }
                );
                self.sink = Some(sink);
                self.converter = Some(converter);
            }
            Err(e) => {
                error!("❌ 打开音频输出失败: {}", e);
                let _ = self.events.send(PlayerEvent::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                self.open_failed = true;
            }
        }
    }

    /// 时钟被 seek 或变速后重新锚定自己的计时基准
    fn resync(&mut self, snapshot: &ClockSnapshot) {
        let first = self.epoch.is_none();
        self.epoch = Some(snapshot.epoch);
        if first {
            self.rate = snapshot.rate;
            self.audio_base = snapshot.time;
            return;
        }

        if (snapshot.rate - self.rate).abs() > f64::EPSILON {
            self.rate = snapshot.rate;
            self.device_changed = true;
            return;
        }

        self.clear_pending();
        if let Some(sink) = self.sink.as_mut() {
            sink.reset();
        }
        self.written_usecs = 0;
        self.processed_usecs = 0;
        self.processed_base = 0;
        self.audio_base = snapshot.time;
    }

    pub(super) fn render(
        &mut self,
        stream: &StreamHandle,
        clock: &ClockController,
        clock_id: ClockId,
        step: &mut bool,
        idle: Duration,
    ) -> Option<Duration> {
        let snapshot = clock.snapshot();
        if self.epoch != Some(snapshot.epoch) {
            self.resync(&snapshot);
        }
        if self.device_changed {
            self.free_output(snapshot.time);
            self.device_changed = false;
        }
        // 暂停期间设备仍在消耗缓冲，恢复时从会话时间重新起算
        if self.resumes != snapshot.resumes {
            self.resumes = snapshot.resumes;
            if let Some(sink) = &self.sink {
                self.processed_usecs = sink.processed_usecs();
            }
            self.processed_base = self.processed_usecs;
            self.audio_base = snapshot.time;
        }
        *step = false;

        let mut written = 0usize;
        if self.pending_offset < self.pending.len() {
            let Some(sink) = self.sink.as_mut() else {
                self.clear_pending();
                return Some(idle);
            };
            written = sink.write(&self.pending[self.pending_offset..]);
            self.pending_offset += written;
            self.processed_usecs = sink.processed_usecs();
            if self.pending_offset >= self.pending.len() {
                self.clear_pending();
            }
        } else {
            let Some(frame) = stream.take_frame() else {
                return Some(idle);
            };
            let frame = match frame {
                Frame::Audio(frame) => frame,
                other => {
                    warn!("音频渲染器收到非音频帧: {:?}", other.kind());
                    return None;
                }
            };

            if self.sink.is_none() && !self.open_failed {
                self.update_output(&frame, snapshot.rate);
            }
            if frame.pts * 1000 < snapshot.seek_time {
                return None;
            }

            let (Some(sink), Some(converter)) = (self.sink.as_mut(), self.converter.as_mut()) else {
                // 没有可用的输出设备：按帧时长空转，时钟按墙钟走
                let usecs = (frame.duration() * 1000) as f64 / snapshot.rate.max(0.01);
                return Some(Duration::from_micros(usecs as u64));
            };

            if !converter.matches(&frame) {
                match Converter::new(frame.sample_rate, frame.channels, sink.format(), snapshot.rate) {
                    Ok(rebuilt) => *converter = rebuilt,
                    Err(e) => {
                        warn!("重建音频转换器失败，丢弃该帧: {}", e);
                        return None;
                    }
                }
            }

            if !snapshot.paused {
                let mut samples = match converter.convert(&frame) {
                    Ok(samples) => samples,
                    Err(e) => {
                        warn!("音频转换失败，丢弃该帧: {}", e);
                        return None;
                    }
                };
                if self.muted {
                    samples.iter_mut().for_each(|s| *s = 0.0);
                }
                written = sink.write(&samples);
                self.processed_usecs = sink.processed_usecs();
                if written < samples.len() {
                    self.pending = samples;
                    self.pending_offset = written;
                }
            }
        }

        let format = match &self.sink {
            Some(sink) => sink.format(),
            None => return Some(idle),
        };
        self.written_usecs += format.duration_for_bytes(written * std::mem::size_of::<f32>());
        let mut timeout = ((self.written_usecs - self.processed_usecs - self.latency_usecs) / 1000).max(0);
        if self.pending_offset < self.pending.len() {
            // 设备缓冲区满了，等它消耗掉一部分
            timeout = timeout.max(self.latency_usecs / 4000).max(1);
        }

        let played = ((self.processed_usecs - self.processed_base) as f64 * snapshot.rate) as i64;
        clock.time_updated(clock_id, self.audio_base + played);
        Some(Duration::from_millis(timeout as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{StreamInfo, TrackType};
    use crate::player::stream_decoder::StreamShared;
    use crate::player::testing::{audio_frame, FakeAudioOutput};
    use crate::player::worker::Signal;

    #[test]
    fn test_passthrough_when_formats_match() {
        let format = AudioFormat { sample_rate: 8000, channels: 2 };
        let mut converter = Converter::new(8000, 2, format, 1.0).unwrap();
        assert!(converter.is_passthrough());

        let frame = audio_frame(0, 20);
        assert_eq!(converter.convert(&frame).unwrap(), frame.data);
    }

    #[test]
    fn test_double_speed_halves_samples() {
        let format = AudioFormat { sample_rate: 48000, channels: 2 };
        let mut converter = Converter::new(48000, 2, format, 2.0).unwrap();
        assert!(!converter.is_passthrough());

        let frame = AudioFrame {
            pts: 0,
            sample_rate: 48000,
            channels: 2,
            data: vec![0.25; 4800 * 2],
        };
        let out = converter.convert(&frame).unwrap();
        let frames = out.len() / 2;
        assert!(frames > 2000 && frames <= 2464, "frames = {}", frames);
    }

    fn audio_stream(frames: usize) -> StreamHandle {
        let stream = Arc::new(StreamShared::new(StreamInfo::default(), TrackType::Audio, 64, Signal::new()));
        for i in 0..frames {
            stream.push_test_frame(Frame::Audio(audio_frame(i as i64 * 20, 20)));
        }
        stream
    }

    #[test]
    fn test_writes_frames_and_reports_time() {
        let output = FakeAudioOutput::new();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut state = AudioState::new(output.clone(), 100_000, tx);
        let clock = ClockController::new();
        let signal = Signal::new();
        let id = clock.register(TrackType::Audio, signal.waker());
        clock.set_paused(false);

        let stream = audio_stream(3);
        let mut step = false;
        for _ in 0..3 {
            state.render(&stream, &clock, id, &mut step, Duration::from_millis(10));
        }

        assert_eq!(output.opened(), vec![AudioFormat { sample_rate: 8000, channels: 2 }]);
        assert_eq!(output.samples().len(), 3 * 160 * 2);
        assert!(output.samples().iter().all(|s| *s != 0.0));
    }

    #[test]
    fn test_muted_outside_rate_window() {
        let output = FakeAudioOutput::new();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut state = AudioState::new(output.clone(), 100_000, tx);
        let clock = ClockController::new();
        let signal = Signal::new();
        let id = clock.register(TrackType::Audio, signal.waker());
        clock.set_playback_rate(4.0);
        clock.set_paused(false);

        let stream = audio_stream(4);
        let mut step = false;
        for _ in 0..4 {
            state.render(&stream, &clock, id, &mut step, Duration::from_millis(10));
        }

        let samples = output.samples();
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_open_failure_reports_error() {
        let output = FakeAudioOutput::failing();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut state = AudioState::new(output, 100_000, tx);
        let clock = ClockController::new();
        let signal = Signal::new();
        let id = clock.register(TrackType::Audio, signal.waker());
        clock.set_paused(false);

        let stream = audio_stream(2);
        let mut step = false;
        let wait = state.render(&stream, &clock, id, &mut step, Duration::from_millis(10));
        assert_eq!(wait, Some(Duration::from_millis(20)));
        assert!(matches!(rx.try_recv(), Ok(PlayerEvent::Error { .. })));

        // 只报告一次
        state.render(&stream, &clock, id, &mut step, Duration::from_millis(10));
        assert!(rx.try_recv().is_err());
    }
}
