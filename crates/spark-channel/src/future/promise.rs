use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::channel::Channel;
use crate::error::{ChannelError, Result};
use crate::event_loop::EventExecutor;

/// Promise 完成时回调的监听器。
pub type FutureListener = Box<dyn FnOnce(&ChannelFuture) + Send + 'static>;

type Outcome = Result<()>;

struct CellState {
    outcome: Option<Outcome>,
    uncancellable: bool,
    listeners: Vec<FutureListener>,
    wakers: Vec<Waker>,
}

/// 非 void Promise 的共享单元。
struct PromiseCell {
    state: Mutex<CellState>,
    done: Condvar,
    executor: Option<Arc<dyn EventExecutor>>,
}

/// void Promise 的目标：失败时回流到哪个通道、是否真的触发异常事件。
#[derive(Clone)]
struct VoidTarget {
    channel: Weak<Channel>,
    fire_exception: bool,
}

#[derive(Clone)]
enum Inner {
    Cell(Arc<PromiseCell>),
    Void(VoidTarget),
}

/// `ChannelFuture` 是异步操作结果的只读视图。
///
/// # 契约说明（What）
/// - `outcome` 为 `None` 表示尚未完成；完成后值不再变化；
/// - 实现 [`std::future::Future`]，可直接 `.await`；
/// - void Future 不可观察：`add_listener`/`wait` 返回 [`ChannelError::VoidPromise`]。
#[derive(Clone)]
pub struct ChannelFuture {
    inner: Inner,
}

/// `ChannelPromise` 是可写的单次赋值完成信号。
///
/// # 教案式说明
/// - **意图 (Why)**：出站操作以 Promise 报告结果，调用方既可注册监听器，也可阻塞或 `.await`；
/// - **契约 (What)**：
///   - `try_*` 系列在已完成时返回 `false`；`set_*` 系列在已完成时返回
///     [`ChannelError::PromiseAlreadyCompleted`]，把编程错误暴露给调用方；
///   - `cancel` 仅在未完成且未被标记为不可取消时生效；
///   - void Promise 永不完成，失败仅在所属通道仍处于已注册状态时转交 `exception_caught`；
/// - **执行逻辑 (How)**：状态位于 `parking_lot::Mutex` 中，监听器在释放锁之后按注册顺序回调，
///   回调 panic 被捕获并记录日志，不影响后续监听器；
/// - **设计权衡 (Trade-offs)**：监听器在完成 Promise 的线程上内联执行，省去一次任务投递；
///   监听器内若需回到事件循环，应自行 `execute`。
#[derive(Clone)]
pub struct ChannelPromise {
    future: ChannelFuture,
}

impl ChannelFuture {
    fn cell(&self) -> Option<&Arc<PromiseCell>> {
        match &self.inner {
            Inner::Cell(cell) => Some(cell),
            Inner::Void(_) => None,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self.inner, Inner::Void(_))
    }

    pub fn is_done(&self) -> bool {
        self.cell()
            .is_some_and(|cell| cell.state.lock().outcome.is_some())
    }

    pub fn is_success(&self) -> bool {
        self.cell()
            .is_some_and(|cell| matches!(cell.state.lock().outcome, Some(Ok(()))))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cell().is_some_and(|cell| {
            matches!(&cell.state.lock().outcome, Some(Err(err)) if err.is_cancelled())
        })
    }

    /// 是否仍可被取消。
    pub fn is_cancellable(&self) -> bool {
        self.cell().is_some_and(|cell| {
            let state = cell.state.lock();
            state.outcome.is_none() && !state.uncancellable
        })
    }

    /// 非阻塞读取结果。
    pub fn outcome(&self) -> Option<Result<()>> {
        self.cell().and_then(|cell| cell.state.lock().outcome.clone())
    }

    /// 失败原因；成功或未完成时为 `None`。
    pub fn cause(&self) -> Option<ChannelError> {
        match self.outcome() {
            Some(Err(err)) => Some(err),
            _ => None,
        }
    }

    /// 注册完成监听器；已完成时立即在当前线程回调。
    pub fn add_listener<F>(&self, listener: F) -> Result<()>
    where
        F: FnOnce(&ChannelFuture) + Send + 'static,
    {
        let Some(cell) = self.cell() else {
            return Err(ChannelError::VoidPromise);
        };
        {
            let mut state = cell.state.lock();
            if state.outcome.is_none() {
                state.listeners.push(Box::new(listener));
                return Ok(());
            }
        }
        notify_listener(Box::new(listener), self);
        Ok(())
    }

    /// 阻塞等待完成并返回结果。
    ///
    /// 在所属事件循环线程上调用会导致死锁，直接返回 [`ChannelError::BlockingOnEventLoop`]。
    pub fn wait(&self) -> Result<()> {
        let cell = self.cell().ok_or(ChannelError::VoidPromise)?;
        let mut state = cell.state.lock();
        if let Some(outcome) = &state.outcome {
            return outcome.clone();
        }
        if cell.executor.as_ref().is_some_and(|e| e.in_event_loop()) {
            return Err(ChannelError::BlockingOnEventLoop);
        }
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            cell.done.wait(&mut state);
        }
    }

    /// 限时等待；超时返回 `None`。
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let cell = self.cell()?;
        let deadline = Instant::now() + timeout;
        let mut state = cell.state.lock();
        if state.outcome.is_none() && cell.executor.as_ref().is_some_and(|e| e.in_event_loop()) {
            return Some(Err(ChannelError::BlockingOnEventLoop));
        }
        while state.outcome.is_none() {
            if cell.done.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.outcome.clone()
    }
}

impl Future for ChannelFuture {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(cell) = self.cell() else {
            return Poll::Ready(Err(ChannelError::VoidPromise));
        };
        let mut state = cell.state.lock();
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl fmt::Debug for ChannelFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Inner::Void(_) => f.write_str("ChannelFuture(void)"),
            Inner::Cell(cell) => f
                .debug_struct("ChannelFuture")
                .field("outcome", &cell.state.lock().outcome)
                .finish(),
        }
    }
}

fn notify_listener(listener: FutureListener, future: &ChannelFuture) {
    if catch_unwind(AssertUnwindSafe(|| listener(future))).is_err() {
        tracing::warn!("an exception was thrown by a future listener");
    }
}

impl ChannelPromise {
    /// 不绑定执行器的 Promise；`wait` 不做死锁检查。
    pub fn new() -> Self {
        Self::with_executor_opt(None)
    }

    /// 绑定执行器的 Promise；在该执行器线程上阻塞等待会被拒绝。
    pub fn with_executor(executor: Arc<dyn EventExecutor>) -> Self {
        Self::with_executor_opt(Some(executor))
    }

    pub(crate) fn with_executor_opt(executor: Option<Arc<dyn EventExecutor>>) -> Self {
        Self {
            future: ChannelFuture {
                inner: Inner::Cell(Arc::new(PromiseCell {
                    state: Mutex::new(CellState {
                        outcome: None,
                        uncancellable: false,
                        listeners: Vec::new(),
                        wakers: Vec::new(),
                    }),
                    done: Condvar::new(),
                    executor,
                })),
            },
        }
    }

    /// 绑定到通道的 void Promise。
    ///
    /// `fire_exception` 为 `false` 时失败被静默丢弃，供通道内部路径使用。
    pub(crate) fn void(channel: Weak<Channel>, fire_exception: bool) -> Self {
        Self {
            future: ChannelFuture {
                inner: Inner::Void(VoidTarget {
                    channel,
                    fire_exception,
                }),
            },
        }
    }

    /// 已成功完成的 Promise。
    pub fn succeeded() -> Self {
        let promise = Self::new();
        promise.try_success();
        promise
    }

    /// 已失败完成的 Promise。
    pub fn failed(cause: ChannelError) -> Self {
        let promise = Self::new();
        promise.try_failure(cause);
        promise
    }

    pub fn future(&self) -> ChannelFuture {
        self.future.clone()
    }

    pub fn is_void(&self) -> bool {
        self.future.is_void()
    }

    pub fn is_done(&self) -> bool {
        self.future.is_done()
    }

    pub fn is_success(&self) -> bool {
        self.future.is_success()
    }

    pub fn is_cancelled(&self) -> bool {
        self.future.is_cancelled()
    }

    pub fn outcome(&self) -> Option<Result<()>> {
        self.future.outcome()
    }

    pub fn cause(&self) -> Option<ChannelError> {
        self.future.cause()
    }

    pub fn add_listener<F>(&self, listener: F) -> Result<()>
    where
        F: FnOnce(&ChannelFuture) + Send + 'static,
    {
        self.future.add_listener(listener)
    }

    pub fn try_success(&self) -> bool {
        match &self.future.inner {
            Inner::Cell(cell) => self.complete(cell, Ok(()), false),
            Inner::Void(_) => false,
        }
    }

    pub fn try_failure(&self, cause: ChannelError) -> bool {
        match &self.future.inner {
            Inner::Cell(cell) => self.complete(cell, Err(cause), false),
            Inner::Void(target) => {
                target.fire(cause);
                false
            }
        }
    }

    /// 标记成功；已完成时返回 [`ChannelError::PromiseAlreadyCompleted`]。
    pub fn set_success(&self) -> Result<()> {
        if self.is_void() || self.try_success() {
            Ok(())
        } else {
            Err(ChannelError::PromiseAlreadyCompleted)
        }
    }

    /// 标记失败；已完成时返回 [`ChannelError::PromiseAlreadyCompleted`]。
    pub fn set_failure(&self, cause: ChannelError) -> Result<()> {
        if self.is_void() {
            self.try_failure(cause);
            return Ok(());
        }
        if self.try_failure(cause) {
            Ok(())
        } else {
            Err(ChannelError::PromiseAlreadyCompleted)
        }
    }

    /// 以结果完成 Promise，等价于按分支调用 `try_success`/`try_failure`/`cancel`。
    pub fn try_complete(&self, outcome: Result<()>) -> bool {
        match outcome {
            Ok(()) => self.try_success(),
            Err(err) if err.is_cancelled() => self.cancel(),
            Err(err) => self.try_failure(err),
        }
    }

    /// 取消尚未完成的操作。
    pub fn cancel(&self) -> bool {
        match &self.future.inner {
            Inner::Cell(cell) => self.complete(cell, Err(ChannelError::Cancelled), true),
            Inner::Void(_) => false,
        }
    }

    /// 标记为不可取消。
    ///
    /// 返回 `true` 表示标记成功或 Promise 已非取消态完成；返回 `false` 表示已被取消。
    pub fn set_uncancellable(&self) -> bool {
        match &self.future.inner {
            Inner::Void(_) => true,
            Inner::Cell(cell) => {
                let mut state = cell.state.lock();
                match &state.outcome {
                    None => {
                        state.uncancellable = true;
                        true
                    }
                    Some(Err(err)) => !err.is_cancelled(),
                    Some(Ok(())) => true,
                }
            }
        }
    }

    /// 把本 Promise 的最终结果级联到 `target`，包括失败与取消。
    pub fn link_outcome(&self, target: &ChannelPromise) -> Result<()> {
        let target = target.clone();
        self.future.add_listener(move |future| {
            if let Some(outcome) = future.outcome() {
                target.try_complete(outcome);
            }
        })
    }

    /// 把 void Promise 转换为可观察的 Promise；非 void 时返回自身。
    ///
    /// 若原 void Promise 会回流异常，新 Promise 的失败同样回流到通道。
    pub fn unvoid(&self) -> ChannelPromise {
        let Inner::Void(target) = &self.future.inner else {
            return self.clone();
        };
        let promise = ChannelPromise::new();
        if target.fire_exception {
            let target = target.clone();
            let _ = promise.add_listener(move |future| {
                if let Some(cause) = future.cause() {
                    target.fire(cause);
                }
            });
        }
        promise
    }

    fn complete(&self, cell: &PromiseCell, outcome: Outcome, respect_uncancellable: bool) -> bool {
        let (listeners, wakers) = {
            let mut state = cell.state.lock();
            if state.outcome.is_some() || (respect_uncancellable && state.uncancellable) {
                return false;
            }
            state.outcome = Some(outcome);
            cell.done.notify_all();
            (
                std::mem::take(&mut state.listeners),
                std::mem::take(&mut state.wakers),
            )
        };
        for waker in wakers {
            waker.wake();
        }
        for listener in listeners {
            notify_listener(listener, &self.future);
        }
        true
    }
}

impl Default for ChannelPromise {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChannelPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChannelPromise").field(&self.future).finish()
    }
}

impl VoidTarget {
    /// 仅当通道仍处于已注册状态时转交 `exception_caught`。
    fn fire(&self, cause: ChannelError) {
        if !self.fire_exception {
            return;
        }
        if let Some(channel) = self.channel.upgrade() {
            if channel.is_registered() {
                channel.pipeline().fire_exception_caught(cause);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn completion_is_single_assignment() {
        let promise = ChannelPromise::new();
        assert!(promise.try_success());
        assert!(!promise.try_failure(ChannelError::Closed));
        assert!(matches!(
            promise.set_success(),
            Err(ChannelError::PromiseAlreadyCompleted)
        ));
        assert!(promise.is_success());
    }

    #[test]
    fn listeners_fire_once_in_registration_order() {
        let promise = ChannelPromise::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for idx in 0..3 {
            let order = Arc::clone(&order);
            promise
                .add_listener(move |_| order.lock().push(idx))
                .expect("注册监听器");
        }
        promise.try_failure(ChannelError::NotYetConnected);
        promise.try_failure(ChannelError::Closed);
        assert_eq!(*order.lock(), vec![0, 1, 2]);

        let late = Arc::new(AtomicUsize::new(0));
        let late_clone = Arc::clone(&late);
        promise
            .add_listener(move |f| {
                assert!(matches!(f.cause(), Some(ChannelError::NotYetConnected)));
                late_clone.fetch_add(1, Ordering::SeqCst);
            })
            .expect("已完成时仍可注册");
        assert_eq!(late.load(Ordering::SeqCst), 1, "已完成 Promise 应立即回调");
    }

    #[test]
    fn uncancellable_blocks_cancel() {
        let promise = ChannelPromise::new();
        assert!(promise.set_uncancellable());
        assert!(!promise.cancel());
        assert!(!promise.is_done());

        let cancelled = ChannelPromise::new();
        assert!(cancelled.cancel());
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.set_uncancellable());
    }

    #[test]
    fn link_outcome_cascades_failure_and_cancellation() {
        let source = ChannelPromise::new();
        let target = ChannelPromise::new();
        source.link_outcome(&target).expect("级联");
        source.try_failure(ChannelError::Closed);
        assert!(matches!(target.cause(), Some(ChannelError::Closed)));

        let source = ChannelPromise::new();
        let target = ChannelPromise::new();
        source.link_outcome(&target).expect("级联");
        source.cancel();
        assert!(target.is_cancelled());
    }

    #[test]
    fn void_promise_is_not_observable() {
        let promise = ChannelPromise::void(Weak::new(), true);
        assert!(promise.is_void());
        assert!(!promise.try_success());
        assert!(promise.set_success().is_ok());
        assert!(matches!(
            promise.add_listener(|_| {}),
            Err(ChannelError::VoidPromise)
        ));
        assert!(matches!(promise.future().wait(), Err(ChannelError::VoidPromise)));
        let observable = promise.unvoid();
        assert!(!observable.is_void());
    }

    #[test]
    fn future_resolves_when_awaited() {
        let promise = ChannelPromise::new();
        let future = promise.future();
        let completer = promise.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            completer.try_success();
        });
        assert!(futures::executor::block_on(future).is_ok());
        handle.join().expect("完成线程");
    }

    #[test]
    fn wait_timeout_reports_pending() {
        let promise = ChannelPromise::new();
        assert!(promise.future().wait_timeout(Duration::from_millis(5)).is_none());
        promise.try_success();
        assert!(matches!(
            promise.future().wait_timeout(Duration::from_millis(5)),
            Some(Ok(()))
        ));
    }
}
