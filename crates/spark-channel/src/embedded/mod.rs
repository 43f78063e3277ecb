//! 内存传输与测试夹具。
//!
//! [`EmbeddedTransport`] 记录钩子调用并支持失败注入，[`EmbeddedChannel`] 把它与
//! [`EmbeddedEventLoop`] 组合起来，让处理器与通道生命周期可以在单线程内确定性地验证。

mod channel;
mod transport;

pub use channel::EmbeddedChannel;
pub use transport::{EmbeddedTransport, TransportHook};

pub use crate::event_loop::EmbeddedEventLoop;
