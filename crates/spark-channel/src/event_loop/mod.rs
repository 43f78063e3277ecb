//! 单线程事件循环契约与实现。
//!
//! ## 契约声明
//! * **线程亲和：** 每个事件循环只拥有一个执行线程；同一通道的生命周期变更、流水线结构变更与处理器回调
//!   全部串行化在该线程上，处理器代码因此无需内部加锁。
//! * **任务顺序：** `execute` 提交的任务按 FIFO 执行；`schedule` 提交的延时任务按截止时间排序，
//!   截止时间相同者按提交顺序执行，到期后与普通任务排在同一队列尾部。
//! * **重入判定：** [`EventExecutor::in_event_loop`] 判断调用方是否已经处于该线程；
//!   为否时，通道与流水线操作必须以任务形式投递而非内联执行。
//!
//! ## 并发与错误语义
//! * **任务隔离：** 单个任务 panic 只会被记录日志，不会终止工作线程；
//! * **拒绝执行：** 关闭完成后提交任务返回 [`ChannelError::RejectedExecution`](crate::ChannelError::RejectedExecution)，
//!   调用方必须处理（记录日志而非崩溃）；
//! * **优雅关闭：** `shutdown_gracefully(quiet_period, timeout)` 先继续执行剩余任务，
//!   直到静默期内无新任务或超过总超时，随后拒绝新任务、取消定时任务并完成终止 Future。

mod default;
mod embedded;
mod registry;
mod scheduled;

use std::any::Any;
use std::time::Duration;

pub use default::{DefaultEventLoop, DefaultEventLoopGroup};
pub use embedded::EmbeddedEventLoop;
pub use registry::ChannelRegistry;
pub use scheduled::ScheduledHandle;

use crate::error::Result;
use crate::future::ChannelFuture;

/// 事件循环执行的任务。
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// `EventExecutor` 定义单线程执行器的调度契约。
///
/// # 契约说明（What）
/// - `execute`：入队异步执行；关闭后返回 `RejectedExecution`；
/// - `schedule`：延时执行，返回可取消的 [`ScheduledHandle`]；
/// - `shutdown_gracefully`：幂等；返回终止 Future；
/// - 实现必须满足 `Send + Sync + 'static`，以 `Arc<dyn EventExecutor>` 形式在通道与上下文之间共享。
pub trait EventExecutor: Any + Send + Sync + 'static {
    /// 调用方是否正运行在该执行器的工作线程上。
    fn in_event_loop(&self) -> bool;

    fn execute(&self, task: Task) -> Result<()>;

    fn schedule(&self, task: Task, delay: Duration) -> Result<ScheduledHandle>;

    fn is_shutting_down(&self) -> bool;

    fn is_terminated(&self) -> bool;

    fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> ChannelFuture;

    fn termination_future(&self) -> ChannelFuture;

    /// 用于日志的执行器名称。
    fn name(&self) -> &str;
}

/// `EventLoop` 是可以承载通道注册的执行器。
///
/// 额外维护一份已注册通道表（活跃集合）：注册成功时加入，注销时移除。
pub trait EventLoop: EventExecutor {
    fn registry(&self) -> &ChannelRegistry;
}

/// 判断两个事件循环句柄是否指向同一实例（忽略 vtable 差异）。
pub(crate) fn same_event_loop(a: &dyn EventLoop, b: &dyn EventLoop) -> bool {
    std::ptr::addr_eq(a as *const dyn EventLoop, b as *const dyn EventLoop)
}
