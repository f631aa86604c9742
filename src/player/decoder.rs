use crate::core::{
    ClockController, EngineConfig, MediaMetaData, PlaybackState, PlayerError, PlayerEvent, Result, StreamInfo,
    TrackType,
};
use crate::output::{AudioOutput, VideoSink};
use crate::player::demuxer::Demuxer;
use crate::player::demuxer_source::DemuxerSource;
use crate::player::ffmpeg_source::FfmpegSource;
use crate::player::renderer::Renderer;
use crate::player::stream_decoder::StreamHandle;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::process;
use std::sync::Arc;
use std::thread;

fn log_ctx() -> String {
    format!("[pid:{}-tid:{:?}]", process::id(), thread::current().id())
}

/// 播放会话：把 Demuxer、渲染器和时钟组装起来
///
/// 所有方法都在宿主线程调用；工作线程产生的通知通过 [`Decoder::poll_events`] 取回。
pub struct Decoder {
    config: EngineConfig,
    clock: ClockController,
    demuxer: Option<Demuxer>,
    video_renderer: Option<Renderer>,
    audio_renderer: Option<Renderer>,
    video_sink: Option<Arc<dyn VideoSink>>,
    audio_output: Option<Arc<dyn AudioOutput>>,

    // 以下按 TrackType::index() 索引
    tracks: [Vec<StreamInfo>; 3],
    requested: [Option<usize>; 3],      // 轨道编号（在 tracks 中的下标）
    applied: [Option<usize>; 3],        // 容器流索引
    streams: [Option<StreamHandle>; 3],

    state: PlaybackState,
    paused: bool,
    duration: i64,
    seekable: bool,
    metadata: MediaMetaData,
    last_position: i64,

    events_tx: Sender<PlayerEvent>,
    events_rx: Receiver<PlayerEvent>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Decoder {
    pub fn new(config: EngineConfig) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            config,
            clock: ClockController::new(),
            demuxer: None,
            video_renderer: None,
            audio_renderer: None,
            video_sink: None,
            audio_output: None,
            tracks: Default::default(),
            requested: [None; 3],
            applied: [None; 3],
            streams: Default::default(),
            state: PlaybackState::Closed,
            paused: true,
            duration: 0,
            seekable: false,
            metadata: MediaMetaData::default(),
            last_position: 0,
            events_tx,
            events_rx,
        }
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state != state {
            info!("{} 🎮 状态: {:?} → {:?}", log_ctx(), self.state, state);
            self.state = state;
            self.emit(PlayerEvent::StateChanged(state));
        }
    }

    // ============= 打开 / 关闭 =============

    /// 打开 URL 或本地文件
    pub fn set_url(&mut self, url: &str) -> Result<()> {
        self.close();
        match FfmpegSource::open(url) {
            Ok(source) => self.set_source(Box::new(source)),
            Err(e) => {
                error!("{} ❌ 无法打开 {}: {}", log_ctx(), url, e);
                self.emit(PlayerEvent::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// 使用已经打开的数据源
    pub fn set_source(&mut self, source: Box<dyn DemuxerSource>) -> Result<()> {
        self.close();
        info!("{} 📂 打开数据源: {}", log_ctx(), source.description());

        let demuxer = Demuxer::start(source, &self.config, self.events_tx.clone()).map_err(|e| {
            self.report_error(&e);
            e
        })?;
        // 线程起来之后才记录轨道，失败时会话保持 Closed 且没有残留
        self.check_streams(demuxer.streams());

        self.seekable = demuxer.is_seekable();
        self.metadata = demuxer.metadata().clone();
        if demuxer.duration() > self.duration {
            self.duration = demuxer.duration();
        }
        self.demuxer = Some(demuxer);
        self.last_position = 0;

        self.emit(PlayerEvent::MetaDataChanged);
        self.emit(PlayerEvent::TracksChanged);
        self.emit(PlayerEvent::DurationChanged(self.duration));
        self.emit(PlayerEvent::SeekableChanged(self.seekable));
        self.set_state(PlaybackState::Opened);

        self.create_video_renderer();
        self.create_audio_renderer();
        Ok(())
    }

    /// 按类型整理流，选出默认轨道；字幕默认关闭
    fn check_streams(&mut self, streams: &[StreamInfo]) {
        let mut duration = 0;
        for kind in TrackType::ALL {
            let list: Vec<StreamInfo> = streams.iter().filter(|s| s.kind == Some(kind)).cloned().collect();
            let pick = match kind {
                TrackType::Subtitle => None,
                _ => list.iter().position(|s| s.is_default).or(if list.is_empty() { None } else { Some(0) }),
            };
            duration = list.iter().map(|s| s.duration).fold(duration, i64::max);

            debug!("{} {} 轨道 {} 条，选中 {:?}", log_ctx(), kind.as_str(), list.len(), pick);
            self.applied[kind.index()] = pick.map(|n| list[n].index);
            self.requested[kind.index()] = pick;
            self.tracks[kind.index()] = list;
        }
        self.duration = duration;
    }

    /// 停止所有线程，回到 Closed
    pub fn close(&mut self) {
        if self.demuxer.is_none() && self.video_renderer.is_none() && self.audio_renderer.is_none() {
            return;
        }
        self.teardown();
        self.tracks = Default::default();
        self.requested = [None; 3];
        self.applied = [None; 3];
        self.duration = 0;
        self.seekable = false;
        self.metadata = MediaMetaData::default();
        self.clock = ClockController::new();
        self.paused = true;
        self.set_state(PlaybackState::Closed);
    }

    /// 暂停后依次停掉视频渲染器、音频渲染器和 Demuxer
    fn teardown(&mut self) {
        self.apply_paused(true);
        if let Some(mut renderer) = self.video_renderer.take() {
            renderer.kill();
        }
        if let Some(mut renderer) = self.audio_renderer.take() {
            renderer.kill();
        }
        if let Some(mut demuxer) = self.demuxer.take() {
            demuxer.kill();
        }
        self.streams = Default::default();
        info!("{} 🛑 会话已拆除", log_ctx());
    }

    // ============= 输出 =============

    fn report_error(&self, err: &PlayerError) {
        error!("{} ❌ {}", log_ctx(), err);
        self.emit(PlayerEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    fn create_video_renderer(&mut self) {
        let (Some(sink), Some(demuxer)) = (self.video_sink.clone(), self.demuxer.as_ref()) else {
            return;
        };
        if self.video_renderer.is_some() || self.applied[TrackType::Video.index()].is_none() {
            return;
        }
        let renderer = match Renderer::video(&self.clock, sink, &self.config) {
            Ok(renderer) => renderer,
            Err(e) => {
                self.report_error(&e);
                return;
            }
        };

        let video = demuxer.add_stream(self.applied[TrackType::Video.index()]);
        renderer.set_stream(video.clone());
        let subtitle = demuxer.add_stream(self.applied[TrackType::Subtitle.index()]);
        renderer.set_subtitle_stream(subtitle.clone());

        self.streams[TrackType::Video.index()] = video;
        self.streams[TrackType::Subtitle.index()] = subtitle;
        self.video_renderer = Some(renderer);
    }

    fn remove_video_renderer(&mut self) {
        let Some(mut renderer) = self.video_renderer.take() else {
            return;
        };
        renderer.kill();
        if let Some(demuxer) = &self.demuxer {
            demuxer.remove_stream(self.applied[TrackType::Video.index()]);
            demuxer.remove_stream(self.applied[TrackType::Subtitle.index()]);
        }
        self.streams[TrackType::Video.index()] = None;
        self.streams[TrackType::Subtitle.index()] = None;
    }

    fn create_audio_renderer(&mut self) {
        let (Some(output), Some(demuxer)) = (self.audio_output.clone(), self.demuxer.as_ref()) else {
            return;
        };
        if self.audio_renderer.is_some() || self.applied[TrackType::Audio.index()].is_none() {
            return;
        }
        let renderer = match Renderer::audio(&self.clock, output, &self.config, self.events_tx.clone()) {
            Ok(renderer) => renderer,
            Err(e) => {
                self.report_error(&e);
                return;
            }
        };

        let audio = demuxer.add_stream(self.applied[TrackType::Audio.index()]);
        renderer.set_stream(audio.clone());
        self.streams[TrackType::Audio.index()] = audio;
        self.audio_renderer = Some(renderer);
    }

    fn remove_audio_renderer(&mut self) {
        let Some(mut renderer) = self.audio_renderer.take() else {
            return;
        };
        renderer.kill();
        if let Some(demuxer) = &self.demuxer {
            demuxer.remove_stream(self.applied[TrackType::Audio.index()]);
        }
        self.streams[TrackType::Audio.index()] = None;
    }

    /// 设置视频输出；None 会停掉视频渲染器和它的流（字幕随视频一起）
    pub fn set_video_sink(&mut self, sink: Option<Arc<dyn VideoSink>>) {
        match sink {
            Some(sink) => {
                self.video_sink = Some(sink.clone());
                match &self.video_renderer {
                    Some(renderer) => renderer.set_video_sink(sink),
                    None => self.create_video_renderer(),
                }
            }
            None => {
                self.video_sink = None;
                self.remove_video_renderer();
            }
        }
    }

    /// 设置音频输出；None 会停掉音频渲染器和它的流
    pub fn set_audio_output(&mut self, output: Option<Arc<dyn AudioOutput>>) {
        match output {
            Some(output) => {
                self.audio_output = Some(output.clone());
                match &self.audio_renderer {
                    Some(renderer) => renderer.set_audio_output(output),
                    None => self.create_audio_renderer(),
                }
            }
            None => {
                self.audio_output = None;
                self.remove_audio_renderer();
            }
        }
    }

    /// 音频设备发生变化，下一步重新打开
    pub fn audio_device_changed(&self) {
        if let Some(renderer) = &self.audio_renderer {
            renderer.device_changed();
        }
    }

    // ============= 轨道 =============

    pub fn tracks(&self, kind: TrackType) -> &[StreamInfo] {
        &self.tracks[kind.index()]
    }

    /// 当前选中的轨道编号
    pub fn active_track(&self, kind: TrackType) -> Option<usize> {
        self.requested[kind.index()]
    }

    /// 切换轨道；越界编号视为关闭该类型
    pub fn set_active_track(&mut self, kind: TrackType, number: Option<usize>) {
        let number = number.filter(|n| *n < self.tracks[kind.index()].len());
        if self.requested[kind.index()] == number {
            return;
        }
        self.requested[kind.index()] = number;
        let index = number.map(|n| self.tracks[kind.index()][n].index);
        self.change_av_track(kind, index);
    }

    fn change_av_track(&mut self, kind: TrackType, index: Option<usize>) {
        let old = self.applied[kind.index()];
        self.applied[kind.index()] = index;
        info!("{} 🔀 切换 {} 轨道: {:?} → {:?}", log_ctx(), kind.as_str(), old, index);

        let has_renderer = match kind {
            TrackType::Audio => self.audio_renderer.is_some(),
            TrackType::Video | TrackType::Subtitle => self.video_renderer.is_some(),
        };
        if self.demuxer.is_none() || !has_renderer {
            // 还没有输出：视频轨道可能因此需要新建渲染器
            if kind == TrackType::Video {
                self.create_video_renderer();
            } else if kind == TrackType::Audio {
                self.create_audio_renderer();
            }
            return;
        }

        let was_paused = self.paused;
        if !was_paused {
            self.apply_paused(true);
        }

        if let Some(demuxer) = &self.demuxer {
            let stream = demuxer.add_stream(index);
            let renderer = match kind {
                TrackType::Audio => self.audio_renderer.as_ref(),
                TrackType::Video | TrackType::Subtitle => self.video_renderer.as_ref(),
            };
            if let Some(renderer) = renderer {
                match kind {
                    TrackType::Subtitle => renderer.set_subtitle_stream(stream.clone()),
                    _ => renderer.set_stream(stream.clone()),
                }
            }
            self.streams[kind.index()] = stream;
            demuxer.remove_stream(old);

            let position = self.clock.current_time() / 1000;
            demuxer.seek(position);
            self.clock.sync_to(position * 1000);
            demuxer.wake();
            self.emit(PlayerEvent::TrackResynced { track: kind, position });
        }

        if !was_paused {
            self.apply_paused(false);
        } else {
            self.trigger_step();
        }
    }

    // ============= 播放控制 =============

    fn apply_paused(&mut self, paused: bool) {
        if self.paused == paused {
            return;
        }
        self.paused = paused;
        self.clock.set_paused(paused);
        if !paused {
            if let Some(demuxer) = &self.demuxer {
                demuxer.start_decoding();
            }
        }
        for renderer in [&self.video_renderer, &self.audio_renderer].into_iter().flatten() {
            renderer.wake();
        }
    }

    pub fn set_paused(&mut self, paused: bool) {
        if self.demuxer.is_none() {
            return;
        }
        self.apply_paused(paused);
        self.set_state(if paused { PlaybackState::Paused } else { PlaybackState::Playing });
    }

    pub fn play(&mut self) {
        self.set_paused(false);
    }

    pub fn pause(&mut self) {
        self.set_paused(true);
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// 暂停状态下让每个渲染器走一步
    fn trigger_step(&self) {
        if let Some(renderer) = &self.audio_renderer {
            renderer.single_step();
        }
        if let Some(renderer) = &self.video_renderer {
            renderer.single_step();
        }
    }

    /// 跳转到指定位置（毫秒）
    pub fn seek(&mut self, position_ms: i64) {
        if !self.seekable {
            warn!("{} ⚠️ 当前媒体不支持 seek", log_ctx());
            return;
        }
        let position = if self.duration > 0 {
            position_ms.clamp(0, self.duration)
        } else {
            position_ms.max(0)
        };
        if self.seek_to(position) {
            self.trigger_step();
        }
    }

    fn seek_to(&mut self, position_ms: i64) -> bool {
        let Some(demuxer) = &self.demuxer else {
            return false;
        };
        let actual = demuxer.seek(position_ms);
        self.clock.sync_to(position_ms * 1000);
        self.last_position = actual;
        self.emit(PlayerEvent::PositionChanged(actual));
        demuxer.wake();
        true
    }

    /// 变速播放；rate 必须为正
    pub fn set_playback_rate(&mut self, rate: f64) {
        if !(rate > 0.0 && rate.is_finite()) {
            warn!("{} ⚠️ 无效的播放速率: {}", log_ctx(), rate);
            return;
        }
        let was_paused = self.paused;
        if !was_paused {
            self.apply_paused(true);
        }
        self.clock.set_playback_rate(rate);
        info!("{} ⏩ 播放速率: {}", log_ctx(), rate);
        if !was_paused {
            self.apply_paused(false);
        }
    }

    pub fn playback_rate(&self) -> f64 {
        self.clock.playback_rate()
    }

    /// 停止：回到开头并清空画面，状态回到 Opened
    pub fn stop(&mut self) {
        if self.demuxer.is_none() {
            return;
        }
        self.apply_paused(true);
        if let Some(demuxer) = &self.demuxer {
            demuxer.stop_decoding();
        }
        self.seek_to(0);

        match &self.video_renderer {
            Some(renderer) => renderer.clear_video_frame(),
            None => {
                if let Some(sink) = &self.video_sink {
                    sink.set_video_frame(None);
                }
            }
        }
        self.set_state(PlaybackState::Opened);
    }

    // ============= 查询 =============

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    /// 当前位置（毫秒）
    pub fn position(&self) -> i64 {
        self.clock.current_time() / 1000
    }

    pub fn is_seekable(&self) -> bool {
        self.seekable
    }

    pub fn metadata(&self) -> &MediaMetaData {
        &self.metadata
    }

    /// 所有接了流的渲染器都报告放完，且流仍处于结束状态
    fn reached_end(&self) -> bool {
        let Some(demuxer) = &self.demuxer else {
            return false;
        };
        let active: Vec<(&Renderer, &StreamHandle)> = [&self.video_renderer, &self.audio_renderer]
            .into_iter()
            .flatten()
            .filter_map(|r| self.streams[r.kind().index()].as_ref().map(|s| (r, s)))
            .collect();
        !active.is_empty()
            && demuxer.at_end()
            && active.iter().all(|(renderer, stream)| renderer.is_drained() && stream.is_finished())
    }

    /// 取回积累的事件；同时产生位置通知并检测播放结束
    pub fn poll_events(&mut self) -> Vec<PlayerEvent> {
        if self.state == PlaybackState::Playing {
            let position = self.position();
            if (position - self.last_position).abs() >= self.config.position_interval_ms {
                self.last_position = position;
                self.emit(PlayerEvent::PositionChanged(position));
            }

            if self.reached_end() {
                info!("{} 🏁 播放结束", log_ctx());
                self.emit(PlayerEvent::EndOfMedia);
                self.stop();
            }
        }
        self.events_rx.try_iter().collect()
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::player::testing::{wait_until, FakeAudioOutput, FakeSource, RecordingVideoSink};
    use std::time::Duration;

    struct Session {
        decoder: Decoder,
        sink: Arc<RecordingVideoSink>,
        audio: Arc<FakeAudioOutput>,
        events: Vec<PlayerEvent>,
    }

    impl Session {
        fn open(source: FakeSource) -> Self {
            let sink = Arc::new(RecordingVideoSink::default());
            let audio = FakeAudioOutput::new();
            let mut decoder = Decoder::default();
            decoder.set_video_sink(Some(sink.clone()));
            decoder.set_audio_output(Some(audio.clone()));
            decoder.set_source(Box::new(source)).unwrap();
            Self {
                decoder,
                sink,
                audio,
                events: Vec::new(),
            }
        }

        fn pump(&mut self) {
            let events = self.decoder.poll_events();
            self.events.extend(events);
        }

        fn wait_for(&mut self, timeout_ms: u64, mut condition: impl FnMut(&Self) -> bool) -> bool {
            wait_until(timeout_ms, || {
                self.pump();
                condition(self)
            })
        }

        fn count(&self, matches: impl Fn(&PlayerEvent) -> bool) -> usize {
            self.events.iter().filter(|e| matches(e)).count()
        }

        fn stream(&self, kind: TrackType) -> Option<StreamHandle> {
            self.decoder.streams[kind.index()].clone()
        }
    }

    fn same_stream(a: &Option<StreamHandle>, b: &Option<StreamHandle>) -> bool {
        match (a, b) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    fn av_source(duration: i64) -> FakeSource {
        FakeSource::builder(duration).video(40, 1000).audio(20).build()
    }

    #[test]
    fn test_open_reports_tracks_and_defaults() {
        let source = FakeSource::builder(3000)
            .video(40, 1000)
            .audio(20)
            .audio(20)
            .subtitle(1000, 500)
            .default_stream(2)
            .build();
        let mut session = Session::open(source);
        session.pump();

        let decoder = &session.decoder;
        assert_eq!(decoder.state(), PlaybackState::Opened);
        assert_eq!(decoder.duration(), 3000);
        assert!(decoder.is_seekable());
        assert_eq!(decoder.metadata().format, "fake");
        assert_eq!(decoder.tracks(TrackType::Audio).len(), 2);
        assert_eq!(decoder.active_track(TrackType::Video), Some(0));
        assert_eq!(decoder.active_track(TrackType::Audio), Some(1));
        assert_eq!(decoder.active_track(TrackType::Subtitle), None);

        assert!(session.events.contains(&PlayerEvent::DurationChanged(3000)));
        assert!(session.events.contains(&PlayerEvent::SeekableChanged(true)));
        assert!(session.events.contains(&PlayerEvent::TracksChanged));
        assert!(session.events.contains(&PlayerEvent::StateChanged(PlaybackState::Opened)));
    }

    #[test]
    fn test_plays_to_end_of_media() {
        let mut session = Session::open(av_source(1000));
        session.decoder.play();

        assert!(session.wait_for(5000, |s| s.count(|e| *e == PlayerEvent::EndOfMedia) > 0));
        assert_eq!(session.decoder.state(), PlaybackState::Opened);
        assert_eq!(session.decoder.position(), 0);

        let frames = session.sink.frames();
        assert!(frames.len() >= 20, "only {} frames shown", frames.len());
        assert!(frames.windows(2).all(|w| w[0] < w[1]));
        assert!(session.sink.clears() >= 1);
        assert!(!session.audio.samples().is_empty());
        assert_eq!(session.count(|e| *e == PlayerEvent::EndOfMedia), 1);
    }

    #[test]
    fn test_seek_then_frames_are_monotonic() {
        let mut session = Session::open(av_source(10_000));
        session.decoder.play();
        assert!(session.wait_for(2000, |s| s.sink.frames().len() >= 3));

        let before = session.sink.frames().len();
        session.decoder.seek(5000);
        assert!(session.wait_for(2000, |s| s.sink.frames().len() >= before + 5));

        assert!(session.events.contains(&PlayerEvent::PositionChanged(5000)));
        let after: Vec<i64> = session.sink.frames()[before..].to_vec();
        // 最多一帧是 seek 之前已经取出的
        let fresh: Vec<i64> = after.iter().copied().skip_while(|pts| *pts < 5000).collect();
        assert!(after.len() - fresh.len() <= 1);
        assert_eq!(fresh.first(), Some(&5000));
        assert!(fresh.windows(2).all(|w| w[0] < w[1]));
        assert!(session.decoder.position() >= 5000);
    }

    #[test]
    fn test_audio_track_switch_resyncs_once() {
        let source = FakeSource::builder(10_000).video(40, 1000).audio(20).audio(20).build();
        let flags = source.discard_flags();
        let mut session = Session::open(source);
        session.decoder.play();
        assert!(session.wait_for(2000, |s| s.decoder.position() >= 300));
        assert_eq!(*flags.lock(), vec![false, false, true]);

        let before = session.sink.frames().len();
        session.decoder.set_active_track(TrackType::Audio, Some(1));
        assert_eq!(session.decoder.active_track(TrackType::Audio), Some(1));
        assert_eq!(*flags.lock(), vec![false, true, false]);
        assert_eq!(session.decoder.state(), PlaybackState::Playing);

        assert!(session.wait_for(2000, |s| s.sink.frames().len() >= before + 8));
        assert_eq!(
            session.count(|e| matches!(e, PlayerEvent::TrackResynced { track: TrackType::Audio, .. })),
            1
        );

        // 视频不中断：切换前后的画面时间戳连续
        let frames = session.sink.frames();
        let around = &frames[before.saturating_sub(1)..];
        assert!(around.windows(2).all(|w| w[1] - w[0] > -200 && w[1] - w[0] <= 300), "{:?}", around);

        // 同一轨道再次选择不会触发重同步
        session.decoder.set_active_track(TrackType::Audio, Some(1));
        session.pump();
        assert_eq!(
            session.count(|e| matches!(e, PlayerEvent::TrackResynced { .. })),
            1
        );
    }

    #[test]
    fn test_subtitle_track_switch_keeps_audio_and_video() {
        let source = FakeSource::builder(10_000)
            .video(40, 1000)
            .audio(20)
            .subtitle(1000, 500)
            .subtitle(1000, 500)
            .build();
        let flags = source.discard_flags();
        let mut session = Session::open(source);
        session.decoder.set_active_track(TrackType::Subtitle, Some(0));
        assert_eq!(*flags.lock(), vec![false, false, false, true]);

        session.decoder.play();
        assert!(session.wait_for(3000, |s| s.sink.subtitles().iter().any(|t| t.is_some())));

        let video = session.stream(TrackType::Video);
        let audio = session.stream(TrackType::Audio);
        let old_subtitle = session.stream(TrackType::Subtitle).unwrap();
        let texts_before = session.sink.subtitles().len();
        let frames_before = session.sink.frames().len();

        session.decoder.set_active_track(TrackType::Subtitle, Some(1));
        assert_eq!(*flags.lock(), vec![false, false, true, false]);
        assert!(same_stream(&session.stream(TrackType::Video), &video));
        assert!(same_stream(&session.stream(TrackType::Audio), &audio));
        let new_subtitle = session.stream(TrackType::Subtitle).unwrap();
        assert!(!Arc::ptr_eq(&new_subtitle, &old_subtitle));
        assert_eq!(session.decoder.state(), PlaybackState::Playing);

        // 切换时叠加层先被清空
        assert!(session.sink.subtitles()[texts_before..].contains(&None));

        // 旧流不再产生帧
        let stale = old_subtitle.queued_frames();
        assert!(session.wait_for(3000, |s| {
            s.sink.frames().len() >= frames_before + 10
                && s.sink.subtitles()[texts_before..].iter().any(|t| t.is_some())
        }));
        assert_eq!(old_subtitle.queued_frames(), stale);
        assert_eq!(
            session.count(|e| matches!(e, PlayerEvent::TrackResynced { track: TrackType::Subtitle, .. })),
            1
        );
    }

    #[test]
    fn test_video_track_switch_keeps_audio() {
        let source = FakeSource::builder(10_000).video(40, 1000).video(40, 1000).audio(20).build();
        let flags = source.discard_flags();
        let mut session = Session::open(source);
        session.decoder.play();
        assert!(session.wait_for(2000, |s| s.sink.frames().len() >= 5));
        assert_eq!(*flags.lock(), vec![false, true, false]);

        let audio = session.stream(TrackType::Audio);
        let old_video = session.stream(TrackType::Video).unwrap();
        let before = session.sink.frames().len();

        session.decoder.set_active_track(TrackType::Video, Some(1));
        assert_eq!(session.decoder.active_track(TrackType::Video), Some(1));
        assert_eq!(*flags.lock(), vec![true, false, false]);
        assert!(same_stream(&session.stream(TrackType::Audio), &audio));
        let new_video = session.stream(TrackType::Video).unwrap();
        assert!(!Arc::ptr_eq(&new_video, &old_video));
        assert_eq!(new_video.index(), 1);

        let stale = old_video.queued_frames();
        assert!(session.wait_for(2000, |s| s.sink.frames().len() >= before + 8));
        assert_eq!(old_video.queued_frames(), stale);
        assert_eq!(session.decoder.state(), PlaybackState::Playing);
        assert_eq!(
            session.count(|e| matches!(e, PlayerEvent::TrackResynced { track: TrackType::Video, .. })),
            1
        );
    }

    #[test]
    fn test_seek_while_paused_shows_single_frame() {
        let mut session = Session::open(av_source(10_000));
        assert!(session.decoder.is_paused());
        let shown = session.sink.frames().len();

        session.decoder.seek(5300);
        assert!(session.wait_for(2000, |s| s.sink.frames().len() > shown));
        std::thread::sleep(Duration::from_millis(100));

        // 5300 之后的第一帧，之后保持暂停
        assert_eq!(session.sink.frames()[shown..], [5320]);
        assert!(session.decoder.is_paused());
        assert_eq!(session.decoder.state(), PlaybackState::Opened);
        assert_eq!(session.decoder.position(), 5300);
    }

    #[test]
    fn test_failed_reopen_leaves_no_tracks() {
        let mut session = Session::open(av_source(3000));
        assert_eq!(session.decoder.tracks(TrackType::Video).len(), 1);

        assert!(session.decoder.set_url("/nonexistent/nothing-here.mkv").is_err());
        assert_eq!(session.decoder.state(), PlaybackState::Closed);
        assert!(TrackType::ALL.iter().all(|kind| session.decoder.tracks(*kind).is_empty()));
        assert!(TrackType::ALL.iter().all(|kind| session.decoder.active_track(*kind).is_none()));
        assert_eq!(session.decoder.duration(), 0);
        assert!(session.stream(TrackType::Video).is_none());
    }

    #[test]
    fn test_pause_twice_then_resume() {
        let mut session = Session::open(av_source(10_000));
        session.decoder.play();
        assert!(session.wait_for(2000, |s| s.decoder.position() >= 100));

        session.decoder.pause();
        let frozen = session.decoder.position();
        session.decoder.pause();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(session.decoder.position(), frozen);
        assert_eq!(session.decoder.state(), PlaybackState::Paused);
        session.pump();
        assert_eq!(session.count(|e| *e == PlayerEvent::StateChanged(PlaybackState::Paused)), 1);

        session.decoder.play();
        assert_eq!(session.decoder.playback_rate(), 1.0);
        assert!(session.wait_for(2000, |s| s.decoder.position() >= frozen + 100));
        assert!(session.decoder.position() < frozen + 1000);
    }

    #[test]
    fn test_stop_returns_to_start() {
        let mut session = Session::open(av_source(10_000));
        session.decoder.play();
        assert!(session.wait_for(2000, |s| s.decoder.position() >= 200));

        session.decoder.stop();
        assert_eq!(session.decoder.state(), PlaybackState::Opened);
        assert_eq!(session.decoder.position(), 0);
        assert!(session.sink.clears() >= 1);

        let shown = session.sink.frames().len();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(session.sink.frames().len(), shown);

        session.decoder.play();
        assert!(session.wait_for(2000, |s| s.sink.frames().len() > shown));
        assert_eq!(session.sink.frames()[shown], 0);
    }

    #[test]
    fn test_playback_rate_change_keeps_playing() {
        let mut session = Session::open(av_source(10_000));
        session.decoder.play();
        assert!(session.wait_for(2000, |s| s.decoder.position() >= 100));

        session.decoder.set_playback_rate(2.0);
        assert_eq!(session.decoder.playback_rate(), 2.0);
        assert_eq!(session.decoder.state(), PlaybackState::Playing);

        session.decoder.set_playback_rate(0.0);
        assert_eq!(session.decoder.playback_rate(), 2.0);

        let start = session.decoder.position();
        assert!(session.wait_for(2000, |s| s.decoder.position() >= start + 300));
    }

    #[test]
    fn test_removing_video_sink_drops_video_stream() {
        let source = FakeSource::builder(5000).video(40, 1000).audio(20).subtitle(1000, 400).build();
        let flags = source.discard_flags();
        let mut session = Session::open(source);
        session.decoder.set_active_track(TrackType::Subtitle, Some(0));
        assert_eq!(*flags.lock(), vec![false, false, false]);

        session.decoder.set_video_sink(None);
        assert_eq!(*flags.lock(), vec![true, false, true]);

        let sink = Arc::new(RecordingVideoSink::default());
        session.decoder.set_video_sink(Some(sink.clone()));
        assert_eq!(*flags.lock(), vec![false, false, false]);

        session.decoder.play();
        assert!(wait_until(2000, || !sink.frames().is_empty()));
    }

    #[test]
    fn test_unopenable_audio_still_plays_video() {
        let source = FakeSource::builder(5000).video(40, 1000).audio(20).unopenable(1).build();
        let mut session = Session::open(source);
        session.decoder.play();

        assert!(session.wait_for(2000, |s| s.sink.frames().len() >= 5));
        assert!(session
            .events
            .iter()
            .any(|e| matches!(e, PlayerEvent::Error { kind: ErrorKind::Format, .. })));
    }

    #[test]
    fn test_open_missing_file_reports_resource_error() {
        let mut decoder = Decoder::default();
        assert!(decoder.set_url("/nonexistent/nothing-here.mkv").is_err());
        assert_eq!(decoder.state(), PlaybackState::Closed);
        let events = decoder.poll_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, PlayerEvent::Error { kind: ErrorKind::Resource, .. })));
    }

    #[test]
    fn test_unseekable_source_ignores_seek() {
        let source = FakeSource::builder(5000).video(40, 1000).unseekable().build();
        let mut session = Session::open(source);
        session.pump();
        assert!(session.events.contains(&PlayerEvent::SeekableChanged(false)));

        session.decoder.seek(3000);
        session.pump();
        assert!(session.events.iter().all(|e| !matches!(e, PlayerEvent::PositionChanged(_))));
        assert_eq!(session.decoder.position(), 0);
    }
}
