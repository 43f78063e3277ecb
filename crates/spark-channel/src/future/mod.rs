//! 异步结果契约：单次赋值的 Promise 与只读 Future 视图。
//!
//! # 模块定位（Why）
//! - 通道的每个出站操作（bind/connect/write/close…）都以 Promise 表达完成信号；
//! - “void” Promise 用于无人观察结果的调用，失败需回流到所属通道的异常路径。
//!
//! # 结构（How）
//! - [`promise`]：[`ChannelPromise`]/[`ChannelFuture`] 的状态机、监听器与阻塞等待；
//! - [`combiner`]：[`PromiseCombiner`]，把多个 Future 聚合为一个 Promise。

mod combiner;
mod promise;

pub use combiner::PromiseCombiner;
pub use promise::{ChannelFuture, ChannelPromise, FutureListener};
