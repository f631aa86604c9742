// 渲染线程：按会话时钟把帧送到输出

mod audio;
mod video;

pub use audio::Converter;

use crate::core::{ClockController, ClockId, EngineConfig, PlayerEvent, Result, TrackType};
use crate::output::{AudioOutput, VideoSink};
use crate::player::stream_decoder::StreamHandle;
use crate::player::worker::{Job, Signal, Waker, Worker, WorkerCore};
use audio::AudioState;
use crossbeam_channel::Sender;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use video::VideoState;

/// 流解码器指向渲染器的非拥有引用
#[derive(Clone)]
pub struct RendererLink {
    core: Weak<WorkerCore<RenderJob>>,
    waker: Waker,
}

impl RendererLink {
    pub fn wake(&self) {
        self.waker.wake();
    }

    /// 流解码器被销毁前调用：渲染器放开这个流
    pub fn detach(&self, stream: &StreamHandle) {
        if let Some(core) = self.core.upgrade() {
            core.lock().detach(stream);
            core.signal().wake();
        }
    }
}

enum RenderOutput {
    Video(VideoState),
    Audio(AudioState),
}

/// 渲染线程上的任务
pub struct RenderJob {
    output: RenderOutput,
    stream: Option<StreamHandle>,
    subtitle: Option<StreamHandle>,
    clock: ClockController,
    clock_id: ClockId,
    step: bool,
    idle: Duration,
    drained: Arc<AtomicBool>,
}

impl RenderJob {
    fn detach(&mut self, stream: &StreamHandle) {
        if self.stream.as_ref().map_or(false, |s| Arc::ptr_eq(s, stream)) {
            debug!("渲染器放开流 {}", stream.index());
            self.stream = None;
            self.stream_changed();
        }
        if self.subtitle.as_ref().map_or(false, |s| Arc::ptr_eq(s, stream)) {
            self.subtitle = None;
            if let RenderOutput::Video(video) = &mut self.output {
                video.clear_subtitle();
            }
        }
    }

    fn stream_changed(&mut self) {
        self.drained.store(false, Ordering::Release);
        if let RenderOutput::Audio(audio) = &mut self.output {
            audio.device_changed();
        }
    }
}

impl Job for RenderJob {
    fn should_wait(&self) -> bool {
        self.clock.is_paused() && !self.step
    }

    fn step(&mut self) -> Option<Duration> {
        let Some(stream) = self.stream.clone() else {
            return Some(self.idle);
        };
        let next = match &mut self.output {
            RenderOutput::Video(video) => video.render(
                &stream,
                self.subtitle.as_ref(),
                &self.clock,
                self.clock_id,
                &mut self.step,
                self.idle,
            ),
            RenderOutput::Audio(audio) => {
                audio.render(&stream, &self.clock, self.clock_id, &mut self.step, self.idle)
            }
        };

        // 流已结束且队列取空：报告放完
        let finished = stream.is_finished();
        if finished && !self.drained.swap(true, Ordering::AcqRel) {
            info!("🏁 流 {} 已放完", stream.index());
        } else if !finished {
            self.drained.store(false, Ordering::Release);
        }
        next
    }

    fn cleanup(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.set_renderer(None);
        }
        if let Some(stream) = self.subtitle.take() {
            stream.set_renderer(None);
        }
        if let RenderOutput::Audio(audio) = &mut self.output {
            audio.free_output(self.clock.current_time());
        }
    }
}

/// 视频或音频渲染器
pub struct Renderer {
    kind: TrackType,
    worker: Worker<RenderJob>,
    clock: ClockController,
    clock_id: ClockId,
    drained: Arc<AtomicBool>,
}

impl Renderer {
    pub fn video(clock: &ClockController, sink: Arc<dyn VideoSink>, config: &EngineConfig) -> Result<Self> {
        Self::spawn(TrackType::Video, clock, RenderOutput::Video(VideoState::new(sink)), config)
    }

    pub fn audio(
        clock: &ClockController,
        output: Arc<dyn AudioOutput>,
        config: &EngineConfig,
        events: Sender<PlayerEvent>,
    ) -> Result<Self> {
        let state = AudioState::new(output, config.audio_buffer_ms * 1000, events);
        Self::spawn(TrackType::Audio, clock, RenderOutput::Audio(state), config)
    }

    fn spawn(kind: TrackType, clock: &ClockController, output: RenderOutput, config: &EngineConfig) -> Result<Self> {
        let signal = Signal::new();
        let clock_id = clock.register(kind, signal.waker());
        let drained = Arc::new(AtomicBool::new(false));
        let job = RenderJob {
            output,
            stream: None,
            subtitle: None,
            clock: clock.clone(),
            clock_id,
            step: false,
            idle: config.idle_interval(),
            drained: drained.clone(),
        };

        let name = match kind {
            TrackType::Audio => "AudioRenderThread",
            _ => "VideoRenderThread",
        };
        let worker = match Worker::spawn(name, signal, job) {
            Ok(worker) => worker,
            Err(e) => {
                clock.unregister(clock_id);
                return Err(e);
            }
        };

        info!("🎬 {} 渲染器已启动 (主时钟: {})", kind.as_str(), clock.is_master(clock_id));
        Ok(Self {
            kind,
            worker,
            clock: clock.clone(),
            clock_id,
            drained,
        })
    }

    pub fn kind(&self) -> TrackType {
        self.kind
    }

    fn link(&self) -> RendererLink {
        RendererLink {
            core: self.worker.downgrade(),
            waker: self.worker.waker(),
        }
    }

    /// 切换消费的流；旧流解绑，新流登记本渲染器
    pub fn set_stream(&self, stream: Option<StreamHandle>) {
        let link = self.link();
        {
            let mut job = self.worker.lock();
            let same = match (&job.stream, &stream) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            if same {
                return;
            }
            if let Some(old) = job.stream.take() {
                old.set_renderer(None);
            }
            job.stream = stream.clone();
            if let Some(new) = &stream {
                new.set_renderer(Some(link));
            }
            job.stream_changed();
        }
        debug!("{} 渲染器切换到流 {:?}", self.kind.as_str(), stream.as_ref().map(|s| s.index()));
        self.worker.wake();
    }

    /// 视频渲染器叠加的字幕流
    pub fn set_subtitle_stream(&self, stream: Option<StreamHandle>) {
        let link = self.link();
        {
            let mut job = self.worker.lock();
            let same = match (&job.subtitle, &stream) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            if same {
                return;
            }
            if let Some(old) = job.subtitle.take() {
                old.set_renderer(None);
            }
            job.subtitle = stream.clone();
            if let Some(new) = &stream {
                new.set_renderer(Some(link));
            }
            if let RenderOutput::Video(video) = &mut job.output {
                video.clear_subtitle();
            }
        }
        self.worker.wake();
    }

    /// 替换视频输出，渲染器本身保留
    pub fn set_video_sink(&self, sink: Arc<dyn VideoSink>) {
        let mut job = self.worker.lock();
        if let RenderOutput::Video(video) = &mut job.output {
            video.set_sink(sink);
        }
    }

    /// 清空视频输出上的画面（锁住任务，确保没有正在送出的帧）
    pub fn clear_video_frame(&self) {
        let job = self.worker.lock();
        if let RenderOutput::Video(video) = &job.output {
            video.clear_frame();
        }
    }

    /// 替换音频输出，下一步重新打开设备
    pub fn set_audio_output(&self, output: Arc<dyn AudioOutput>) {
        let mut job = self.worker.lock();
        if let RenderOutput::Audio(audio) = &mut job.output {
            audio.set_output(output);
        }
    }

    /// 暂停状态下也执行一步（显示 seek 后的第一帧）
    pub fn single_step(&self) {
        self.worker.lock().step = true;
        self.worker.interrupt();
    }

    /// 音频设备变化：下一步重建输出和转换器
    pub fn device_changed(&self) {
        let mut job = self.worker.lock();
        if let RenderOutput::Audio(audio) = &mut job.output {
            audio.device_changed();
        }
    }

    pub fn wake(&self) {
        self.worker.wake();
    }

    /// 当前流已经结束并且所有帧都送出去了
    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Acquire)
    }

    pub fn kill(&mut self) {
        if self.worker.is_running() {
            self.worker.kill();
            self.clock.unregister(self.clock_id);
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.kill();
    }
}
