use crate::core::{EngineConfig, Frame, Packet, Result, StreamInfo, TrackType};
use crate::player::codec::{Codec, Received};
use crate::player::renderer::RendererLink;
use crate::player::worker::{Job, Signal, Waker, Worker};
use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 渲染器持有的流句柄
pub type StreamHandle = Arc<StreamShared>;

#[derive(Default)]
struct PacketQueue {
    queue: VecDeque<Packet>,
    size: usize,
    duration: i64,
}

struct FrameQueue {
    queue: VecDeque<Frame>,
    max: usize,
}

/// 解码线程与 Demuxer / 渲染器共享的状态
///
/// 每个队列各有一把小锁；和其他线程的联系（Demuxer 唤醒句柄、渲染器）
/// 也放在单独的锁里，这样唤醒别人时不需要拿任何工作线程的任务锁。
pub struct StreamShared {
    info: StreamInfo,
    kind: TrackType,
    packets: Mutex<PacketQueue>,
    frames: Mutex<FrameQueue>,
    demuxer: Mutex<Option<Waker>>,
    renderer: Mutex<Option<RendererLink>>,
    eos: AtomicBool,
    signal: Arc<Signal>,
}

impl StreamShared {
    pub fn new(info: StreamInfo, kind: TrackType, max_frames: usize, signal: Arc<Signal>) -> Self {
        Self {
            info,
            kind,
            packets: Mutex::new(PacketQueue::default()),
            frames: Mutex::new(FrameQueue {
                queue: VecDeque::new(),
                max: max_frames.max(1),
            }),
            demuxer: Mutex::new(None),
            renderer: Mutex::new(None),
            eos: AtomicBool::new(false),
            signal,
        }
    }

    /// 容器中的流索引
    pub fn index(&self) -> usize {
        self.info.index
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn kind(&self) -> TrackType {
        self.kind
    }

    // ============= 数据包队列 =============

    /// 入队一个数据包（或流结束标记），唤醒解码线程
    pub fn add_packet(&self, packet: Packet) {
        {
            let mut packets = self.packets.lock();
            packets.size += packet.size();
            packets.duration += packet.duration();
            packets.queue.push_back(packet);
        }
        self.signal.wake();
    }

    /// 取出最早的数据包；队列空时唤醒 Demuxer 并返回 None，从不阻塞
    pub fn take_packet(&self) -> Option<Packet> {
        let packet = {
            let mut packets = self.packets.lock();
            let packet = packets.queue.pop_front();
            if let Some(p) = &packet {
                packets.size -= p.size();
                packets.duration -= p.duration();
            }
            packet
        };
        self.wake_demuxer();
        packet
    }

    pub fn has_packets(&self) -> bool {
        !self.packets.lock().queue.is_empty()
    }

    /// 排队中的字节数
    pub fn queued_bytes(&self) -> usize {
        self.packets.lock().size
    }

    /// 排队中的时长（毫秒）
    pub fn queued_duration(&self) -> i64 {
        self.packets.lock().duration
    }

    pub fn queued_packets(&self) -> usize {
        self.packets.lock().queue.len()
    }

    // ============= 帧队列 =============

    fn push_frame(&self, frame: Frame) {
        self.frames.lock().queue.push_back(frame);
        self.wake_renderer();
    }

    #[cfg(test)]
    pub(crate) fn push_test_frame(&self, frame: Frame) {
        self.push_frame(frame);
    }

    #[cfg(test)]
    pub(crate) fn end_test_stream(&self) {
        self.set_end_of_stream();
    }

    fn has_enough_frames(&self) -> bool {
        let frames = self.frames.lock();
        frames.queue.len() >= frames.max
    }

    /// 取走最早的帧并唤醒解码线程补帧
    pub fn take_frame(&self) -> Option<Frame> {
        let frame = self.frames.lock().queue.pop_front();
        self.signal.wake();
        frame
    }

    /// 查看最早的帧（不取走）
    pub fn peek_frame(&self) -> Option<Frame> {
        self.frames.lock().queue.front().cloned()
    }

    /// 最早一帧的时间戳
    pub fn front_pts(&self) -> Option<i64> {
        self.frames.lock().queue.front().map(|f| f.pts())
    }

    /// 丢掉最早的帧（通常是刚 peek 过的那一帧）
    pub fn pop_front_frame(&self) {
        self.frames.lock().queue.pop_front();
        self.signal.wake();
    }

    pub fn queued_frames(&self) -> usize {
        self.frames.lock().queue.len()
    }

    // ============= 状态 =============

    /// 解码端已经结束
    pub fn is_end_of_stream(&self) -> bool {
        self.eos.load(Ordering::Acquire)
    }

    /// 解码结束且所有帧都已被取走
    pub fn is_finished(&self) -> bool {
        self.is_end_of_stream() && self.frames.lock().queue.is_empty()
    }

    fn set_end_of_stream(&self) {
        self.eos.store(true, Ordering::Release);
        self.wake_renderer();
    }

    // ============= 与其他线程的联系 =============

    /// 设置唯一的消费渲染器（None 表示解绑）
    pub fn set_renderer(&self, renderer: Option<RendererLink>) {
        let mut slot = self.renderer.lock();
        *slot = renderer;
        if let Some(link) = slot.as_ref() {
            link.wake();
        }
    }

    pub fn set_demuxer(&self, demuxer: Option<Waker>) {
        *self.demuxer.lock() = demuxer;
    }

    fn wake_demuxer(&self) {
        if let Some(waker) = self.demuxer.lock().as_ref() {
            waker.wake();
        }
    }

    fn wake_renderer(&self) {
        if let Some(link) = self.renderer.lock().as_ref() {
            link.wake();
        }
    }
}

/// 解码线程上的任务
pub struct DecodeJob {
    codec: Box<dyn Codec>,
    shared: StreamHandle,
    draining: bool,
}

impl DecodeJob {
    /// 丢弃解码器状态和两个队列（seek 时由 Demuxer 在锁住本线程后调用）
    pub fn flush(&mut self) {
        self.codec.flush();
        {
            let mut packets = self.shared.packets.lock();
            packets.queue.clear();
            packets.size = 0;
            packets.duration = 0;
        }
        self.shared.frames.lock().queue.clear();
        self.shared.eos.store(false, Ordering::Release);
        self.draining = false;
    }

    /// 撤销尚未处理完的流结束标记，让已排空的解码器重新接收数据包。
    /// 已解出的帧保留。
    pub fn rearm(&mut self) {
        if self.draining || self.shared.is_end_of_stream() {
            self.codec.flush();
        }
        self.shared.packets.lock().queue.retain(|p| !p.is_end_of_stream());
        self.shared.eos.store(false, Ordering::Release);
        self.draining = false;
    }

    pub fn shared(&self) -> &StreamHandle {
        &self.shared
    }

    fn decode(&mut self) {
        match self.codec.receive_frame() {
            Ok(Received::Frame(frame)) => {
                self.shared.push_frame(frame);
                return;
            }
            Ok(Received::EndOfStream) => {
                debug!("流 {} 解码结束", self.shared.index());
                self.shared.set_end_of_stream();
                return;
            }
            Ok(Received::NeedsInput) => {
                if self.draining {
                    self.shared.set_end_of_stream();
                    return;
                }
            }
            Err(e) => {
                warn!("流 {} 解码错误（已跳过）: {}", self.shared.index(), e);
            }
        }

        let Some(packet) = self.shared.take_packet() else {
            return;
        };
        if packet.is_end_of_stream() {
            self.draining = true;
        }
        if let Err(e) = self.codec.send_packet(&packet) {
            warn!("流 {} 送包失败（已丢弃）: {}", self.shared.index(), e);
        }
    }

    fn decode_subtitle(&mut self) {
        let Some(packet) = self.shared.take_packet() else {
            return;
        };
        if packet.is_end_of_stream() {
            self.shared.set_end_of_stream();
            return;
        }
        match self.codec.decode_subtitle(&packet) {
            Ok(Some(subtitle)) => {
                debug!("字幕 [{} - {}]: {}", subtitle.pts, subtitle.end_pts, subtitle.text);
                self.shared.push_frame(Frame::Subtitle(subtitle));
            }
            Ok(None) => {}
            Err(e) => warn!("字幕解码失败（已跳过）: {}", e),
        }
    }
}

impl Job for DecodeJob {
    fn should_wait(&self) -> bool {
        self.shared.is_end_of_stream()
            || (!self.shared.has_packets() && !self.draining)
            || self.shared.has_enough_frames()
    }

    fn step(&mut self) -> Option<Duration> {
        match self.shared.kind {
            TrackType::Subtitle => self.decode_subtitle(),
            _ => self.decode(),
        }
        None
    }

    fn cleanup(&mut self) {
        debug!("流 {} 解码线程退出", self.shared.index());
    }
}

/// 单个流的解码器：数据包队列 → 解码线程 → 帧队列
pub struct StreamDecoder {
    shared: StreamHandle,
    worker: Worker<DecodeJob>,
}

impl StreamDecoder {
    pub fn start(info: &StreamInfo, codec: Box<dyn Codec>, config: &EngineConfig, demuxer: Waker) -> Result<Self> {
        let kind = codec.kind();
        let index = info.index;
        let signal = Signal::new();
        let shared = Arc::new(StreamShared::new(
            info.clone(),
            kind,
            config.frame_queue_size(kind),
            signal.clone(),
        ));
        shared.set_demuxer(Some(demuxer));

        let name = match kind {
            TrackType::Video => "VideoDecoderThread",
            TrackType::Audio => "AudioDecoderThread",
            TrackType::Subtitle => "SubtitleDecoderThread",
        };
        let job = DecodeJob {
            codec,
            shared: shared.clone(),
            draining: false,
        };
        let worker = Worker::spawn(name, signal, job)?;

        info!("▶️ 流 {} ({}) 解码器已启动", index, kind.as_str());
        Ok(Self { shared, worker })
    }

    pub fn handle(&self) -> StreamHandle {
        self.shared.clone()
    }

    pub fn add_packet(&self, packet: Packet) {
        self.shared.add_packet(packet);
    }

    /// 锁住解码线程（会等它当前这一步结束）
    pub fn lock(&self) -> MutexGuard<'_, DecodeJob> {
        self.worker.lock()
    }

    pub fn clear_demuxer(&self) {
        self.shared.set_demuxer(None);
    }

    /// 先让渲染器放手，再停止并回收线程
    pub fn kill(&mut self) {
        let link = self.shared.renderer.lock().take();
        if let Some(link) = link {
            link.detach(&self.shared);
        }
        self.worker.kill();
    }
}

impl Drop for StreamDecoder {
    fn drop(&mut self) {
        self.kill();
    }
}
