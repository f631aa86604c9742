use log::{debug, info};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::core::Result;

/// 工作线程上运行的任务
///
/// 线程在每一步之间持有任务锁，只有在挂起等待时才释放。
/// 因此外部线程锁住任务就能冻结这个循环（seek 依赖这一点）。
pub trait Job: Send + 'static {
    /// 返回 true 时线程挂起，直到被唤醒
    fn should_wait(&self) -> bool {
        false
    }

    /// 执行一步；返回值是下一步之前至少要等待的时间
    fn step(&mut self) -> Option<Duration>;

    /// 线程退出前调用
    fn cleanup(&mut self) {}
}

struct SignalState {
    woken: bool,
    exit: bool,
    deadline: Option<Instant>,
}

/// 唤醒信号
///
/// 与任务锁分离：唤醒只碰这把小锁，不会被正在执行的一步阻塞，
/// `woken` 标志保证不会丢失唤醒。
pub struct Signal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SignalState {
                woken: false,
                exit: false,
                deadline: None,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn waker(self: &Arc<Self>) -> Waker {
        Waker(Arc::downgrade(self))
    }

    pub fn wake(&self) {
        self.state.lock().woken = true;
        self.cond.notify_all();
    }

    /// 唤醒并取消正在等待的节拍延时
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.woken = true;
        state.deadline = None;
        self.cond.notify_all();
    }

    fn request_exit(&self) {
        self.state.lock().exit = true;
        self.cond.notify_all();
    }

    fn is_exiting(&self) -> bool {
        self.state.lock().exit
    }

    fn set_timeout(&self, timeout: Option<Duration>) {
        self.state.lock().deadline = timeout.filter(|t| !t.is_zero()).map(|t| Instant::now() + t);
    }

    fn has_deadline(&self) -> bool {
        self.state.lock().deadline.is_some()
    }

    /// 挂起直到被唤醒、延时到期或要求退出
    fn park(&self) {
        let mut state = self.state.lock();
        loop {
            if state.exit {
                return;
            }
            if state.woken {
                state.woken = false;
                return;
            }
            match state.deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    state.deadline = None;
                    return;
                }
                Some(deadline) => {
                    self.cond.wait_until(&mut state, deadline);
                }
                None => self.cond.wait(&mut state),
            }
        }
    }
}

/// 指向某个工作线程的非拥有唤醒句柄
#[derive(Clone)]
pub struct Waker(Weak<Signal>);

impl Waker {
    pub fn wake(&self) {
        if let Some(signal) = self.0.upgrade() {
            signal.wake();
        }
    }

    pub fn interrupt(&self) {
        if let Some(signal) = self.0.upgrade() {
            signal.interrupt();
        }
    }
}

pub struct WorkerCore<J: Job> {
    job: Mutex<J>,
    signal: Arc<Signal>,
}

impl<J: Job> WorkerCore<J> {
    pub fn lock(&self) -> MutexGuard<'_, J> {
        self.job.lock()
    }

    pub fn signal(&self) -> &Arc<Signal> {
        &self.signal
    }
}

/// 工作线程：循环执行 `Job::step`，直到被 kill
pub struct Worker<J: Job> {
    core: Arc<WorkerCore<J>>,
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl<J: Job> Worker<J> {
    /// 启动线程。`signal` 由调用者预先创建，以便任务本身能持有自己的 `Waker`。
    pub fn spawn(name: &str, signal: Arc<Signal>, job: J) -> Result<Self> {
        let core = Arc::new(WorkerCore {
            job: Mutex::new(job),
            signal,
        });

        let thread_core = core.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run(thread_core))?;

        debug!("🧵 工作线程已启动: {}", name);
        Ok(Self {
            core,
            handle: Some(handle),
            name: name.to_string(),
        })
    }

    fn run(core: Arc<WorkerCore<J>>) {
        let mut job = core.job.lock();
        loop {
            if core.signal.is_exiting() {
                break;
            }
            if core.signal.has_deadline() || job.should_wait() {
                MutexGuard::unlocked(&mut job, || core.signal.park());
                continue;
            }
            let timeout = job.step();
            core.signal.set_timeout(timeout);
        }
        job.cleanup();
    }

    /// 锁住任务（会等待当前这一步执行完）
    pub fn lock(&self) -> MutexGuard<'_, J> {
        self.core.lock()
    }

    pub fn wake(&self) {
        self.core.signal.wake();
    }

    pub fn interrupt(&self) {
        self.core.signal.interrupt();
    }

    pub fn waker(&self) -> Waker {
        self.core.signal.waker()
    }

    pub fn downgrade(&self) -> Weak<WorkerCore<J>> {
        Arc::downgrade(&self.core)
    }

    /// 请求退出并等待线程结束
    pub fn kill(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.core.signal.request_exit();
            if handle.thread().id() == thread::current().id() {
                return;
            }
            let _ = handle.join();
            info!("🛑 工作线程已退出: {}", self.name);
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl<J: Job> Drop for Worker<J> {
    fn drop(&mut self) {
        self.kill();
    }
}
