use crate::core::{ClockController, ClockId, Frame};
use crate::output::VideoSink;
use crate::player::stream_decoder::StreamHandle;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

pub(super) struct VideoState {
    sink: Arc<dyn VideoSink>,
    subtitle_text: Option<String>,
}

impl VideoState {
    pub(super) fn new(sink: Arc<dyn VideoSink>) -> Self {
        Self {
            sink,
            subtitle_text: None,
        }
    }

    pub(super) fn set_sink(&mut self, sink: Arc<dyn VideoSink>) {
        self.sink = sink;
        self.subtitle_text = None;
    }

    pub(super) fn clear_subtitle(&mut self) {
        self.subtitle_text = None;
        self.sink.set_subtitle_text(None);
    }

    pub(super) fn clear_frame(&self) {
        self.sink.set_video_frame(None);
    }

    fn show_subtitle(&mut self, text: Option<String>) {
        if self.subtitle_text != text {
            self.subtitle_text = text.clone();
            self.sink.set_subtitle_text(text);
        }
    }

    /// 字幕叠加：显示覆盖当前帧起点的那一条，过期的丢掉
    fn update_subtitle(&mut self, subtitle: &StreamHandle, start: i64) {
        match subtitle.peek_frame() {
            Some(Frame::Subtitle(current)) => {
                if current.end_pts < start {
                    subtitle.pop_front_frame();
                    self.show_subtitle(None);
                } else if current.pts <= start && current.end_pts > start {
                    self.show_subtitle(Some(current.text));
                }
            }
            _ => self.show_subtitle(None),
        }
    }

    pub(super) fn render(
        &mut self,
        stream: &StreamHandle,
        subtitle: Option<&StreamHandle>,
        clock: &ClockController,
        clock_id: ClockId,
        step: &mut bool,
        idle: Duration,
    ) -> Option<Duration> {
        let Some(frame) = stream.take_frame() else {
            return Some(idle);
        };
        let frame = match frame {
            Frame::Video(frame) => frame,
            other => {
                warn!("视频渲染器收到非视频帧: {:?}", other.kind());
                return None;
            }
        };

        // seek 目标之前的帧直接丢掉，立即取下一帧
        if frame.pts * 1000 < clock.seek_time() {
            debug!("丢弃 seek 之前的视频帧: {}", frame.pts);
            return None;
        }

        let start = frame.pts;
        let duration = stream.info().frame_duration().unwrap_or(frame.duration);

        if let Some(subtitle) = subtitle {
            self.update_subtitle(subtitle, start);
        }

        self.sink.set_video_frame(Some(frame));
        *step = false;

        let next = stream.front_pts().unwrap_or(start + duration);
        let now = clock.time_updated(clock_id, start * 1000);
        let wait = clock.usecs_to(now, next * 1000) / 1000;
        Some(Duration::from_millis(wait.max(0) as u64))
    }
}
