//! 出站缓冲与写队列辅助组件。
//!
//! ## 契约声明
//! * **背压计数：** 出站缓冲、[`PendingWriteQueue`]、[`BatchingPendingWriteQueue`] 与绑定通道的
//!   [`CoalescingBufferQueue`] 共享通道的一份 [`WritabilityState`]，任何一处截留的字节都会影响可写性；
//! * **滞回：** 待写字节达到高水位才变为不可写，回落到低水位及以下才恢复可写；
//!   可写性事件只在布尔值真正翻转时触发一次；
//! * **释放责任：** 消息一旦被拒绝或失败，由出站层负责 `release`，调用方不得重复释放。

mod batching;
mod buffer;
mod coalescing;
mod pending_write_queue;
mod writability;

pub use batching::BatchingPendingWriteQueue;
pub use buffer::{ChannelOutboundBuffer, OutboundNotification};
pub use coalescing::{CoalescingBufferQueue, CompositionStrategy};
pub use pending_write_queue::PendingWriteQueue;
pub use writability::WritabilityState;

pub(crate) use writability::Transition;
