//! 处理器流水线：节点链表、事件派发与结构变更。
//!
//! ## 契约声明
//! * **方向：** 入站事件自头哨兵流向尾哨兵，出站操作自尾哨兵流向头哨兵，头哨兵把出站操作交给
//!   [`ChannelUnsafe`](crate::channel::ChannelUnsafe)；
//! * **跳过掩码：** 节点只接收 [`ChannelHandler::interest`] 声明的事件，其余事件直接越过；
//! * **线程亲和：** 每个节点的回调运行在其执行器上，默认与通道的事件循环相同；
//!   跨线程调用被封装为任务投递，投递失败时释放消息、失败 Promise；
//! * **生命周期：** `handler_added` 先于任何事件到达处理器，`handler_removed` 至多调用一次；
//!   通道注册之前的结构变更登记在队列中，首次注册时按插入顺序回放。

mod context;
mod handler;
#[allow(clippy::module_inception)]
mod pipeline;
mod sentinel;
mod sharable;

pub use context::ChannelHandlerContext;
pub use handler::{ChannelHandler, EventMask};
pub use pipeline::ChannelPipeline;
pub use sentinel::{LoggingInboundSink, UnhandledInboundSink};
