#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
//! `spark-channel`：事件驱动传输核心。
//!
//! # 模块定位（Why）
//! - 为具体传输（TCP、进程内管道、测试桩…）提供共用的通道生命周期状态机、处理器流水线、
//!   单线程事件循环与出站背压；具体 I/O 通过 [`Transport`] 钩子注入；
//! - 处理器代码依赖“同一通道的全部回调串行执行在一个事件循环上”这一不变式，因此无需内部加锁。
//!
//! # 结构（How）
//! - [`future`]：单次赋值的 Promise/Future 与聚合器；
//! - [`event_loop`]：执行器契约、线程化事件循环及组、手动驱动的嵌入式事件循环；
//! - [`channel`]：通道身份、状态机与底层操作 [`ChannelUnsafe`]；
//! - [`pipeline`]：处理器链、上下文派发与跳过掩码；
//! - [`outbound`]：出站缓冲、可写性滞回与写队列辅助组件；
//! - [`embedded`]：内存传输与测试夹具；
//! - [`config`]、[`error`]、[`message`]、[`observability`]：配置、错误域、消息承载与日志键名。
//!
//! # 使用示例
//! ```
//! use spark_channel::embedded::EmbeddedChannel;
//! use spark_channel::PipelineMessage;
//! use spark_buffer::ByteBuf;
//!
//! let channel = EmbeddedChannel::new(Vec::new()).expect("注册应成功");
//! assert!(channel.write_outbound([PipelineMessage::from(ByteBuf::from_static(b"ping"))]).unwrap());
//! let written = channel.read_outbound().expect("传输应写出消息");
//! assert_eq!(written.as_buffer().map(|buf| buf.readable_bytes()), Some(4));
//! assert!(!channel.finish().unwrap());
//! ```

pub mod channel;
pub mod config;
pub mod embedded;
pub mod error;
pub mod event_loop;
pub mod future;
pub mod message;
pub mod observability;
pub mod outbound;
pub mod pipeline;

pub use channel::{
    Channel, ChannelBuilder, ChannelId, ChannelMetadata, ChannelUnsafe, ConnectOutcome, RejectedMessage,
    SocketAddress, Transport,
};
pub use config::{ChannelConfig, ChannelConfigSnapshot, EventLoopConfig, WriteBufferWaterMark};
pub use error::{ChannelError, Result, codes};
pub use event_loop::{
    ChannelRegistry, DefaultEventLoop, DefaultEventLoopGroup, EmbeddedEventLoop, EventExecutor, EventLoop,
    ScheduledHandle, Task,
};
pub use future::{ChannelFuture, ChannelPromise, PromiseCombiner};
pub use message::{
    ChannelOutputShutdownEvent, DefaultMessageSizeEstimator, MessageSizeEstimator, PipelineMessage, UserEvent,
};
pub use outbound::{
    BatchingPendingWriteQueue, ChannelOutboundBuffer, CoalescingBufferQueue, CompositionStrategy, PendingWriteQueue,
};
pub use pipeline::{
    ChannelHandler, ChannelHandlerContext, ChannelPipeline, EventMask, LoggingInboundSink, UnhandledInboundSink,
};
