use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::default::panic_message;
use super::scheduled::TimerQueue;
use super::{ChannelRegistry, EventExecutor, EventLoop, ScheduledHandle, Task};
use crate::error::{ChannelError, Result};
use crate::future::{ChannelFuture, ChannelPromise};

struct EmbeddedState {
    tasks: VecDeque<Task>,
    timers: TimerQueue<Duration>,
    /// 虚拟时钟，自创建起累计。
    now: Duration,
}

/// `EmbeddedEventLoop` 是由调用方手动驱动的确定性事件循环。
///
/// # 契约说明（What）
/// - `in_event_loop` 恒为 `true`：所有通道操作内联执行，“稍后执行”的任务只在
///   [`run_pending_tasks`](Self::run_pending_tasks) 时运行；
/// - 定时任务基于虚拟时钟，调用 [`advance_time`](Self::advance_time) 推进；
/// - 用于测试与单线程嵌入场景，不创建任何线程。
pub struct EmbeddedEventLoop {
    state: Mutex<EmbeddedState>,
    shut_down: AtomicBool,
    registry: ChannelRegistry,
    termination: ChannelPromise,
}

impl EmbeddedEventLoop {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EmbeddedState {
                tasks: VecDeque::new(),
                timers: TimerQueue::new(),
                now: Duration::ZERO,
            }),
            shut_down: AtomicBool::new(false),
            registry: ChannelRegistry::new(),
            termination: ChannelPromise::new(),
        }
    }

    /// 依次执行队列中的任务，包括执行过程中新提交的任务，直到队列为空。
    pub fn run_pending_tasks(&self) -> usize {
        let mut executed = 0;
        loop {
            let task = self.state.lock().tasks.pop_front();
            let Some(task) = task else {
                return executed;
            };
            if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
                tracing::warn!(
                    event_loop.name = "embedded",
                    panic = %panic_message(panic.as_ref()),
                    "a task raised a panic; the event loop keeps running"
                );
            }
            executed += 1;
        }
    }

    /// 执行当前虚拟时刻已到期的定时任务；返回距下一个定时任务的间隔。
    pub fn run_scheduled_pending_tasks(&self) -> Option<Duration> {
        loop {
            let task = {
                let mut state = self.state.lock();
                let now = state.now;
                state.timers.pop_due(now)
            };
            match task {
                Some(task) => {
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
                        tracing::warn!(
                            event_loop.name = "embedded",
                            panic = %panic_message(panic.as_ref()),
                            "a scheduled task raised a panic"
                        );
                    }
                }
                None => break,
            }
        }
        let mut state = self.state.lock();
        let now = state.now;
        state.timers.next_deadline().map(|deadline| deadline - now)
    }

    /// 推进虚拟时钟并执行到期任务与普通任务。
    pub fn advance_time(&self, delta: Duration) {
        self.state.lock().now += delta;
        self.run_scheduled_pending_tasks();
        self.run_pending_tasks();
    }

    /// 当前虚拟时刻。
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    pub fn has_pending_tasks(&self) -> bool {
        !self.state.lock().tasks.is_empty()
    }
}

impl Default for EmbeddedEventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventExecutor for EmbeddedEventLoop {
    fn in_event_loop(&self) -> bool {
        true
    }

    fn execute(&self, task: Task) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ChannelError::RejectedExecution);
        }
        self.state.lock().tasks.push_back(task);
        Ok(())
    }

    fn schedule(&self, task: Task, delay: Duration) -> Result<ScheduledHandle> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ChannelError::RejectedExecution);
        }
        let mut state = self.state.lock();
        let deadline = state.now + delay;
        Ok(state.timers.push(deadline, task))
    }

    fn is_shutting_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn is_terminated(&self) -> bool {
        self.termination.is_done()
    }

    /// 立即执行剩余任务后终止；虚拟时钟下静默期与超时没有意义，参数被忽略。
    fn shutdown_gracefully(&self, _quiet_period: Duration, _timeout: Duration) -> ChannelFuture {
        if !self.termination.is_done() {
            self.run_pending_tasks();
            self.shut_down.store(true, Ordering::Release);
            self.state.lock().timers.cancel_all();
            self.registry.clear();
            self.termination.try_success();
        }
        self.termination.future()
    }

    fn termination_future(&self) -> ChannelFuture {
        self.termination.future()
    }

    fn name(&self) -> &str {
        "embedded"
    }
}

impl EventLoop for EmbeddedEventLoop {
    fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn tasks_run_only_when_pumped() {
        let event_loop = EmbeddedEventLoop::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let task_counter = Arc::clone(&counter);
        event_loop
            .execute(Box::new(move || {
                task_counter.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("提交任务");
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(event_loop.run_pending_tasks(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn virtual_clock_drives_scheduled_tasks() {
        let event_loop = EmbeddedEventLoop::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        event_loop
            .schedule(
                Box::new(move || flag.store(true, Ordering::SeqCst)),
                Duration::from_secs(3),
            )
            .expect("提交定时任务");
        assert_eq!(
            event_loop.run_scheduled_pending_tasks(),
            Some(Duration::from_secs(3))
        );
        event_loop.advance_time(Duration::from_secs(2));
        assert!(!fired.load(Ordering::SeqCst));
        event_loop.advance_time(Duration::from_secs(1));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn shutdown_rejects_new_tasks() {
        let event_loop = EmbeddedEventLoop::new();
        let terminated = event_loop.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
        assert!(terminated.is_success());
        assert!(matches!(
            event_loop.execute(Box::new(|| {})),
            Err(ChannelError::RejectedExecution)
        ));
    }
}
