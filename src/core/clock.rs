use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

use super::types::TrackType;
use crate::player::worker::Waker;

/// 注册到时钟上的渲染器标识
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockId(u64);

/// 某一时刻时钟状态的一致快照
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSnapshot {
    pub time: i64,          // 微秒
    pub rate: f64,
    pub paused: bool,
    pub seek_time: i64,     // 微秒
    pub epoch: u64,
    pub resumes: u64,       // 从暂停恢复的次数
}

/// 会话时钟 - 用于音视频同步
///
/// 时间、速率、暂停状态都在同一把锁下读写，其他线程不会看到不一致的组合。
/// 同一时刻只有一个渲染器是主时钟：只有它上报的时间会推进基准，
/// 其他渲染器按 `current_time()` 对齐。有音频渲染器时音频为主。
#[derive(Clone)]
pub struct ClockController {
    inner: Arc<Mutex<ClockInner>>,
}

struct ClockInner {
    base_time: i64,             // 基准时刻对应的播放时间（微秒）
    base_instant: Instant,      // 基准时刻
    playback_rate: f64,
    paused: bool,
    seek_time: i64,
    epoch: u64,                 // seek / 变速时递增，渲染器据此重建自己的基准
    resumes: u64,
    master: Option<ClockId>,
    clocks: Vec<(ClockId, TrackType, Waker)>,
    next_id: u64,
}

impl ClockInner {
    fn current_time(&self) -> i64 {
        if self.paused {
            self.base_time
        } else {
            let elapsed = self.base_instant.elapsed().as_micros() as f64;
            self.base_time + (elapsed * self.playback_rate) as i64
        }
    }

    fn rebase(&mut self, time: i64) {
        self.base_time = time;
        self.base_instant = Instant::now();
    }

    fn elect_master(&mut self) {
        self.master = self
            .clocks
            .iter()
            .find(|(_, kind, _)| *kind == TrackType::Audio)
            .or_else(|| self.clocks.first())
            .map(|(id, _, _)| *id);
    }

    fn wake_all(&self) {
        for (_, _, waker) in &self.clocks {
            waker.interrupt();
        }
    }
}

impl ClockController {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockInner {
                base_time: 0,
                base_instant: Instant::now(),
                playback_rate: 1.0,
                paused: true,
                seek_time: 0,
                epoch: 0,
                resumes: 0,
                master: None,
                clocks: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// 注册一个渲染器，必要时重新选举主时钟
    pub fn register(&self, kind: TrackType, waker: Waker) -> ClockId {
        let mut inner = self.inner.lock();
        let id = ClockId(inner.next_id);
        inner.next_id += 1;
        inner.clocks.push((id, kind, waker));
        inner.elect_master();
        id
    }

    pub fn unregister(&self, id: ClockId) {
        let mut inner = self.inner.lock();
        inner.clocks.retain(|(clock, _, _)| *clock != id);
        inner.elect_master();
    }

    pub fn is_master(&self, id: ClockId) -> bool {
        self.inner.lock().master == Some(id)
    }

    /// 当前播放时间（微秒）
    pub fn current_time(&self) -> i64 {
        self.inner.lock().current_time()
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        let inner = self.inner.lock();
        ClockSnapshot {
            time: inner.current_time(),
            rate: inner.playback_rate,
            paused: inner.paused,
            seek_time: inner.seek_time,
            epoch: inner.epoch,
            resumes: inner.resumes,
        }
    }

    /// 渲染器上报自己的播放时间；主时钟的上报会成为新的基准。
    /// 返回上报后的会话时间。
    pub fn time_updated(&self, id: ClockId, time: i64) -> i64 {
        let mut inner = self.inner.lock();
        if inner.master == Some(id) && !inner.paused {
            inner.rebase(time);
        }
        inner.current_time()
    }

    /// 从 `current` 播放到 `target` 需要等待的墙钟时间（微秒）
    pub fn usecs_to(&self, current: i64, target: i64) -> i64 {
        let inner = self.inner.lock();
        if inner.paused || inner.playback_rate <= 0.0 {
            return 0;
        }
        ((target - current) as f64 / inner.playback_rate) as i64
    }

    /// Seek 后重新锚定时间
    pub fn sync_to(&self, usecs: i64) {
        let mut inner = self.inner.lock();
        inner.rebase(usecs);
        inner.seek_time = usecs;
        inner.epoch += 1;
        inner.wake_all();
    }

    pub fn seek_time(&self) -> i64 {
        self.inner.lock().seek_time
    }

    #[cfg(test)]
    fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// 暂停 / 恢复；重复设置相同状态无副作用
    pub fn set_paused(&self, paused: bool) {
        let mut inner = self.inner.lock();
        if inner.paused == paused {
            return;
        }
        if paused {
            let now = inner.current_time();
            inner.base_time = now;
            inner.paused = true;
        } else {
            inner.base_instant = Instant::now();
            inner.paused = false;
            inner.resumes += 1;
        }
        inner.wake_all();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// 变速：先按旧速率结算当前时间，再切换速率
    pub fn set_playback_rate(&self, rate: f64) {
        let mut inner = self.inner.lock();
        let now = inner.current_time();
        inner.rebase(now);
        inner.playback_rate = rate;
        inner.epoch += 1;
        inner.wake_all();
    }

    pub fn playback_rate(&self) -> f64 {
        self.inner.lock().playback_rate
    }
}

impl Default for ClockController {
    fn default() -> Self {
        Self::new()
    }
}
