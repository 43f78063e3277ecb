use std::any::Any;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::scheduled::TimerQueue;
use super::{ChannelRegistry, EventExecutor, EventLoop, ScheduledHandle, Task};
use crate::config::EventLoopConfig;
use crate::error::{ChannelError, Result};
use crate::future::{ChannelFuture, ChannelPromise, PromiseCombiner};

const NOT_STARTED: u8 = 0;
const STARTED: u8 = 1;
const SHUTTING_DOWN: u8 = 2;
const SHUTDOWN: u8 = 3;
const TERMINATED: u8 = 4;

struct ShutdownRequest {
    quiet_period: Duration,
    timeout: Duration,
    started_at: Instant,
    last_activity: Instant,
}

impl ShutdownRequest {
    fn confirmed(&self, now: Instant) -> bool {
        now >= self.started_at + self.timeout
            || now.duration_since(self.last_activity) >= self.quiet_period
    }

    fn next_check(&self) -> Instant {
        (self.last_activity + self.quiet_period).min(self.started_at + self.timeout)
    }
}

struct LoopQueue {
    tasks: VecDeque<Task>,
    timers: TimerQueue<Instant>,
    shutdown: Option<ShutdownRequest>,
}

struct LoopShared {
    name: String,
    queue: Mutex<LoopQueue>,
    wakeup: Condvar,
    /// 只在持有 `queue` 锁时写入，读取可无锁。
    phase: AtomicU8,
    thread: OnceLock<ThreadId>,
    registry: ChannelRegistry,
    termination: ChannelPromise,
}

/// `DefaultEventLoop` 是基于独立 OS 线程的单线程事件循环。
///
/// # 教案式说明
/// - **意图 (Why)**：为通道提供串行化执行环境，使处理器代码无需加锁；
/// - **逻辑 (How)**：
///   - 工作线程在首次提交任务时惰性启动；
///   - `parking_lot::Mutex<LoopQueue>` 保护 FIFO 任务队列与定时堆，`Condvar` 负责唤醒；
///   - 每轮先把到期定时任务移入 FIFO 尾部，再取队首执行；任务 panic 被 `catch_unwind` 隔离；
///   - 关闭请求到达后取消定时任务，继续执行剩余任务，直至静默期内无新任务或超过总超时；
/// - **契约 (What)**：阶段迁移 `NOT_STARTED → STARTED → SHUTTING_DOWN → SHUTDOWN → TERMINATED`，
///   进入 `SHUTDOWN` 后 `execute`/`schedule` 返回 `RejectedExecution`；
/// - **风险 (Trade-offs)**：已注册通道表持有通道强引用，事件循环必须显式关闭才能回收这些通道。
pub struct DefaultEventLoop {
    shared: Arc<LoopShared>,
    config: EventLoopConfig,
}

impl DefaultEventLoop {
    pub fn new(config: EventLoopConfig) -> Self {
        Self::with_name(config.thread_name.clone(), config)
    }

    fn with_name(name: String, config: EventLoopConfig) -> Self {
        Self {
            shared: Arc::new(LoopShared {
                name,
                queue: Mutex::new(LoopQueue {
                    tasks: VecDeque::new(),
                    timers: TimerQueue::new(),
                    shutdown: None,
                }),
                wakeup: Condvar::new(),
                phase: AtomicU8::new(NOT_STARTED),
                thread: OnceLock::new(),
                registry: ChannelRegistry::new(),
                termination: ChannelPromise::new(),
            }),
            config,
        }
    }

    /// 按默认静默期与超时优雅关闭。
    pub fn shutdown(&self) -> ChannelFuture {
        self.shutdown_gracefully(self.config.quiet_period, self.config.shutdown_timeout)
    }

    fn phase(&self) -> u8 {
        self.shared.phase.load(Ordering::Acquire)
    }

    /// 入队并在必要时启动工作线程。
    fn submit(&self, push: impl FnOnce(&mut LoopQueue)) -> Result<()> {
        let start = {
            let mut queue = self.shared.queue.lock();
            let phase = self.phase();
            if phase >= SHUTDOWN {
                return Err(ChannelError::RejectedExecution);
            }
            push(&mut queue);
            self.shared.wakeup.notify_one();
            if phase == NOT_STARTED {
                self.shared.phase.store(STARTED, Ordering::Release);
                true
            } else {
                false
            }
        };
        if start {
            self.start_thread()?;
        }
        Ok(())
    }

    fn start_thread(&self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || run(shared));
        if let Err(err) = spawned {
            tracing::error!(event_loop.name = %self.shared.name, error = %err, "failed to start event loop thread");
            let dropped = {
                let mut queue = self.shared.queue.lock();
                self.shared.phase.store(TERMINATED, Ordering::Release);
                queue.timers.cancel_all();
                std::mem::take(&mut queue.tasks)
            };
            drop(dropped);
            self.shared.termination.try_success();
            return Err(ChannelError::RejectedExecution);
        }
        Ok(())
    }
}

impl Default for DefaultEventLoop {
    fn default() -> Self {
        Self::new(EventLoopConfig::default())
    }
}

fn run_task(name: &str, task: Task) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
        tracing::warn!(
            event_loop.name = %name,
            panic = %panic_message(panic.as_ref()),
            "a task raised a panic; the event loop keeps running"
        );
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}

/// 工作线程主循环。
fn run(shared: Arc<LoopShared>) {
    let _ = shared.thread.set(thread::current().id());
    loop {
        let next = {
            let mut queue = shared.queue.lock();
            loop {
                let now = Instant::now();
                while let Some(task) = queue.timers.pop_due(now) {
                    queue.tasks.push_back(task);
                }
                if let Some(task) = queue.tasks.pop_front() {
                    if let Some(request) = queue.shutdown.as_mut() {
                        request.last_activity = now;
                    }
                    break Some(task);
                }
                if let Some(request) = &queue.shutdown {
                    if request.confirmed(now) {
                        break None;
                    }
                    let check_at = request.next_check();
                    let _ = shared.wakeup.wait_until(&mut queue, check_at);
                    continue;
                }
                match queue.timers.next_deadline() {
                    Some(deadline) => {
                        let _ = shared.wakeup.wait_until(&mut queue, deadline);
                    }
                    None => shared.wakeup.wait(&mut queue),
                }
            }
        };
        match next {
            Some(task) => run_task(&shared.name, task),
            None => break,
        }
    }

    {
        let mut queue = shared.queue.lock();
        shared.phase.store(SHUTDOWN, Ordering::Release);
        queue.timers.cancel_all();
    }
    // 进入 SHUTDOWN 之前入队的任务仍需执行完毕。
    loop {
        let task = shared.queue.lock().tasks.pop_front();
        match task {
            Some(task) => run_task(&shared.name, task),
            None => break,
        }
    }
    shared.phase.store(TERMINATED, Ordering::Release);
    shared.registry.clear();
    tracing::debug!(event_loop.name = %shared.name, "event loop terminated");
    shared.termination.try_success();
}

impl EventExecutor for DefaultEventLoop {
    fn in_event_loop(&self) -> bool {
        self.shared.thread.get() == Some(&thread::current().id())
    }

    fn execute(&self, task: Task) -> Result<()> {
        self.submit(move |queue| queue.tasks.push_back(task))
    }

    fn schedule(&self, task: Task, delay: Duration) -> Result<ScheduledHandle> {
        let mut handle = None;
        let deadline = Instant::now() + delay;
        self.submit(|queue| {
            if queue.shutdown.is_some() {
                // 关闭期间的定时任务不会再被执行。
                let scheduled = queue.timers.push(deadline, task);
                scheduled.cancel();
                handle = Some(scheduled);
            } else {
                handle = Some(queue.timers.push(deadline, task));
            }
        })?;
        handle.ok_or(ChannelError::RejectedExecution)
    }

    fn is_shutting_down(&self) -> bool {
        self.phase() >= SHUTTING_DOWN
    }

    fn is_terminated(&self) -> bool {
        self.phase() == TERMINATED
    }

    fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> ChannelFuture {
        let terminate_now = {
            let mut queue = self.shared.queue.lock();
            match self.phase() {
                NOT_STARTED => {
                    self.shared.phase.store(TERMINATED, Ordering::Release);
                    true
                }
                STARTED => {
                    let now = Instant::now();
                    queue.shutdown = Some(ShutdownRequest {
                        quiet_period,
                        timeout: timeout.max(quiet_period),
                        started_at: now,
                        last_activity: now,
                    });
                    queue.timers.cancel_all();
                    self.shared.phase.store(SHUTTING_DOWN, Ordering::Release);
                    self.shared.wakeup.notify_all();
                    false
                }
                _ => false,
            }
        };
        if terminate_now {
            self.shared.registry.clear();
            self.shared.termination.try_success();
        }
        self.shared.termination.future()
    }

    fn termination_future(&self) -> ChannelFuture {
        self.shared.termination.future()
    }

    fn name(&self) -> &str {
        &self.shared.name
    }
}

impl EventLoop for DefaultEventLoop {
    fn registry(&self) -> &ChannelRegistry {
        &self.shared.registry
    }
}

/// 一组 [`DefaultEventLoop`]，以轮询方式分配给新通道。
pub struct DefaultEventLoopGroup {
    loops: Vec<Arc<DefaultEventLoop>>,
    cursor: AtomicUsize,
    config: EventLoopConfig,
}

impl DefaultEventLoopGroup {
    /// 创建 `threads` 个事件循环；线程名为 `<thread_name>-<序号>`。
    pub fn new(threads: usize, config: EventLoopConfig) -> Result<Self> {
        if threads == 0 {
            return Err(ChannelError::invalid_config(
                "event loop group needs at least one thread",
            ));
        }
        let loops = (0..threads)
            .map(|idx| {
                Arc::new(DefaultEventLoop::with_name(
                    format!("{}-{idx}", config.thread_name),
                    config.clone(),
                ))
            })
            .collect();
        Ok(Self {
            loops,
            cursor: AtomicUsize::new(0),
            config,
        })
    }

    /// 轮询取下一个事件循环。
    pub fn next(&self) -> Arc<DefaultEventLoop> {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        Arc::clone(&self.loops[idx])
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DefaultEventLoop>> {
        self.loops.iter()
    }

    /// 关闭全部事件循环；返回的 Future 在所有成员终止后完成。
    pub fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> ChannelFuture {
        let combiner = PromiseCombiner::new();
        for event_loop in &self.loops {
            // 终止 Future 均为非 void，`add` 不会失败。
            let _ = combiner.add(&event_loop.shutdown_gracefully(quiet_period, timeout));
        }
        let aggregate = ChannelPromise::new();
        let _ = combiner.finish(aggregate.clone());
        aggregate.future()
    }

    pub fn shutdown(&self) -> ChannelFuture {
        self.shutdown_gracefully(self.config.quiet_period, self.config.shutdown_timeout)
    }
}
