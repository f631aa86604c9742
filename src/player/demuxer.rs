use crate::core::{EngineConfig, ErrorKind, MediaMetaData, Packet, PlayerEvent, Result, StreamInfo};
use crate::player::demuxer_source::DemuxerSource;
use crate::player::stream_decoder::{DecodeJob, StreamDecoder, StreamHandle};
use crate::player::worker::{Job, Signal, Waker, Worker};
use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use parking_lot::MutexGuard;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// Demuxer 线程上的任务：读包并按流分发
pub struct DemuxJob {
    source: Box<dyn DemuxerSource>,
    slots: Vec<Option<StreamDecoder>>,
    stopped: bool,
    at_end: Arc<AtomicBool>,
    last_pts: i64,
    config: EngineConfig,
    events: Sender<PlayerEvent>,
    waker: Waker,
}

impl DemuxJob {
    fn decoders(&self) -> impl Iterator<Item = &StreamDecoder> {
        self.slots.iter().flatten()
    }

    /// 丢弃标志与已安装的流保持一致
    fn update_enabled_streams(&mut self) {
        for index in 0..self.slots.len() {
            let discard = self.slots[index].is_none();
            self.source.set_discard(index, discard);
        }
    }

    fn add_stream(&mut self, index: usize) -> Option<StreamHandle> {
        if index >= self.slots.len() {
            warn!("{} add_stream: 流索引越界 {}", log_ctx(), index);
            return None;
        }
        if let Some(existing) = &self.slots[index] {
            return Some(existing.handle());
        }

        let info = self.source.streams()[index].clone();
        let codec = match self.source.open_codec(index) {
            Ok(codec) => codec,
            Err(e) => {
                error!("{} ❌ 流 {} 无法打开解码器: {}", log_ctx(), index, e);
                let _ = self.events.send(PlayerEvent::Error {
                    kind: ErrorKind::Format,
                    message: e.to_string(),
                });
                return None;
            }
        };
        let decoder = match StreamDecoder::start(&info, codec, &self.config, self.waker.clone()) {
            Ok(decoder) => decoder,
            Err(e) => {
                error!("{} ❌ 流 {} 解码线程启动失败: {}", log_ctx(), index, e);
                let _ = self.events.send(PlayerEvent::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                return None;
            }
        };

        // 已经发过结束标记的 Demuxer 不会再给它送包
        if self.stopped {
            decoder.add_packet(Packet::end_of_stream());
        }

        let handle = decoder.handle();
        self.slots[index] = Some(decoder);
        self.update_enabled_streams();
        info!("{} ➕ 安装流 {} ({})", log_ctx(), index, handle.kind().as_str());
        Some(handle)
    }

    fn remove_stream(&mut self, index: usize) {
        let Some(mut decoder) = self.slots.get_mut(index).and_then(Option::take) else {
            return;
        };
        decoder.clear_demuxer();
        decoder.kill();
        self.update_enabled_streams();
        info!("{} ➖ 移除流 {}", log_ctx(), index);
    }

    /// 给每个流送一次结束标记（重复调用无效）
    fn send_final_packets(&mut self) {
        if self.stopped {
            return;
        }
        for decoder in self.decoders() {
            debug!("{} 向流 {} 发送结束标记", log_ctx(), decoder.handle().index());
            decoder.add_packet(Packet::end_of_stream());
        }
        self.stopped = true;
    }

    fn read_one(&mut self) {
        let packet = match self.source.read_packet() {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                info!("{} 🏁 Demuxer 读到文件末尾", log_ctx());
                self.at_end.store(true, Ordering::Release);
                self.send_final_packets();
                return;
            }
            Err(e) => {
                warn!("{} ⚠️ 读取数据包失败，按文件结束处理: {}", log_ctx(), e);
                self.at_end.store(true, Ordering::Release);
                self.send_final_packets();
                return;
            }
        };

        if self.last_pts < 0 {
            if let Some(pts) = packet.pts() {
                self.last_pts = pts;
            }
        }

        let Some(index) = packet.stream_index() else {
            return;
        };
        match self.slots.get(index).and_then(Option::as_ref) {
            Some(decoder) => decoder.add_packet(packet),
            None => debug!("丢弃未安装流 {} 的数据包", index),
        }
    }

    fn seek(&mut self, position_ms: i64) -> i64 {
        {
            // 先全部锁住再刷新，避免某个解码线程在中途吃进旧数据
            let mut locked: Vec<MutexGuard<'_, DecodeJob>> = self.decoders().map(|d| d.lock()).collect();
            for job in locked.iter_mut() {
                job.flush();
            }
        }

        if let Err(e) = self.source.seek(position_ms) {
            warn!("{} ⚠️ Seek 到 {}ms 失败: {}", log_ctx(), position_ms, e);
        }
        self.last_pts = -1;
        self.stopped = false;
        self.at_end.store(false, Ordering::Release);

        while self.last_pts < 0 && !self.stopped {
            self.read_one();
        }
        let actual = if self.last_pts >= 0 { self.last_pts } else { position_ms };
        info!("{} ⏩ Demuxer seek {}ms → {}ms", log_ctx(), position_ms, actual);
        actual
    }

    fn start_decoding(&mut self) {
        if !self.stopped || self.at_end.load(Ordering::Acquire) {
            return;
        }
        for decoder in self.decoders() {
            decoder.lock().rearm();
        }
        self.stopped = false;
        debug!("{} Demuxer 恢复读取", log_ctx());
    }
}

impl Job for DemuxJob {
    fn should_wait(&self) -> bool {
        if self.stopped {
            return true;
        }
        let mut queued_bytes = 0;
        let mut buffers_full = true;
        for decoder in self.decoders() {
            let stream = decoder.handle();
            if stream.queued_duration() < self.config.min_buffered_ms {
                buffers_full = false;
            }
            queued_bytes += stream.queued_bytes();
        }
        queued_bytes > self.config.max_queue_bytes || buffers_full
    }

    fn step(&mut self) -> Option<Duration> {
        self.read_one();
        None
    }

    fn cleanup(&mut self) {
        info!("{} Demuxer 线程退出: {}", log_ctx(), self.source.description());
        for decoder in self.decoders() {
            decoder.clear_demuxer();
        }
        for slot in self.slots.iter_mut() {
            if let Some(mut decoder) = slot.take() {
                decoder.kill();
            }
        }
    }
}

/// 解封装器：拥有数据源和所有流解码器
pub struct Demuxer {
    worker: Worker<DemuxJob>,
    at_end: Arc<AtomicBool>,
    streams: Vec<StreamInfo>,
    duration: i64,
    seekable: bool,
    metadata: MediaMetaData,
}

impl Demuxer {
    /// 接管数据源并启动 Demuxer 线程（此时还没有安装任何流）
    pub fn start(source: Box<dyn DemuxerSource>, config: &EngineConfig, events: Sender<PlayerEvent>) -> Result<Self> {
        let streams = source.streams().to_vec();
        let duration = source.duration();
        let seekable = source.is_seekable();
        let metadata = source.metadata();
        info!("{} 🎬 Demuxer 启动: {}", log_ctx(), source.description());

        let signal = Signal::new();
        let at_end = Arc::new(AtomicBool::new(false));
        let job = DemuxJob {
            source,
            slots: (0..streams.len()).map(|_| None).collect(),
            stopped: false,
            at_end: at_end.clone(),
            last_pts: -1,
            config: config.clone(),
            events,
            waker: signal.waker(),
        };
        let worker = Worker::spawn("Demuxer", signal, job)?;

        Ok(Self {
            worker,
            at_end,
            streams,
            duration,
            seekable,
            metadata,
        })
    }

    pub fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn is_seekable(&self) -> bool {
        self.seekable
    }

    pub fn metadata(&self) -> &MediaMetaData {
        &self.metadata
    }

    /// 为流打开解码器并开始送包；`None` 或打不开时返回 None
    pub fn add_stream(&self, index: Option<usize>) -> Option<StreamHandle> {
        let index = index?;
        let handle = self.worker.lock().add_stream(index);
        self.worker.wake();
        handle
    }

    pub fn remove_stream(&self, index: Option<usize>) {
        let Some(index) = index else {
            return;
        };
        self.worker.lock().remove_stream(index);
        self.worker.wake();
    }

    /// 向后 seek 到关键帧，返回实际落点（毫秒）
    pub fn seek(&self, position_ms: i64) -> i64 {
        let actual = self.worker.lock().seek(position_ms);
        self.worker.wake();
        actual
    }

    /// 给所有流送结束标记，不拆除任何东西
    pub fn stop_decoding(&self) {
        self.worker.lock().send_final_packets();
    }

    /// 恢复被 `stop_decoding` 停下的读取；文件已读完时什么也不做
    pub fn start_decoding(&self) {
        self.worker.lock().start_decoding();
        self.worker.wake();
    }

    pub fn wake(&self) {
        self.worker.wake();
    }

    /// 是否已经读到容器末尾
    pub fn at_end(&self) -> bool {
        self.at_end.load(Ordering::Acquire)
    }

    pub fn kill(&mut self) {
        self.worker.kill();
    }
}

impl Drop for Demuxer {
    fn drop(&mut self) {
        self.kill();
    }
}
