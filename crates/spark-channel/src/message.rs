use std::any::Any;
use std::fmt;

use spark_buffer::{ByteBuf, ReferenceCounted};

/// `PipelineMessage` 统一承载网络层字节与业务层对象。
///
/// # 设计背景（Why）
/// - 流水线需要在编解码器、业务处理器与传输层之间传递异构数据，因此以枚举屏蔽具体类型；
/// - 出站缓冲只对字节缓冲做引用计数释放，业务对象的生命周期交给 Rust 所有权。
///
/// # 逻辑解析（How）
/// - `Buffer` 变体封装引用计数的 [`ByteBuf`]，失败路径调用 [`PipelineMessage::release`] 归还计数；
/// - `User` 变体封装任意 `Send` 对象，通过 `Any` 支持运行时下转型。
///
/// # 设计考量（Trade-offs & Gotchas）
/// - **调试输出**：`Debug` 实现隐藏负载内容，避免在日志中泄漏敏感数据。
pub enum PipelineMessage {
    /// L4/L5 字节缓冲。
    Buffer(ByteBuf),
    /// L7 业务消息。
    User(Box<dyn Any + Send>),
}

/// 入站用户事件的承载类型。
pub type UserEvent = Box<dyn Any + Send>;

impl PipelineMessage {
    /// 以任意业务对象构造消息。
    pub fn user<T: Any + Send>(value: T) -> Self {
        PipelineMessage::User(Box::new(value))
    }

    pub fn as_buffer(&self) -> Option<&ByteBuf> {
        match self {
            PipelineMessage::Buffer(buf) => Some(buf),
            PipelineMessage::User(_) => None,
        }
    }

    pub fn into_buffer(self) -> Result<ByteBuf, Self> {
        match self {
            PipelineMessage::Buffer(buf) => Ok(buf),
            other => Err(other),
        }
    }

    /// 尝试把业务消息下转型为 `T`；类型不符时原样返回。
    pub fn downcast_user<T: Any>(self) -> Result<T, Self> {
        match self {
            PipelineMessage::User(value) => match value.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(value) => Err(PipelineMessage::User(value)),
            },
            other => Err(other),
        }
    }

    pub fn user_ref<T: Any>(&self) -> Option<&T> {
        match self {
            PipelineMessage::User(value) => value.downcast_ref::<T>(),
            PipelineMessage::Buffer(_) => None,
        }
    }

    /// 释放消息持有的一次引用计数；业务对象直接丢弃。
    ///
    /// 计数异常只记录日志，不向调用方传播：释放发生在失败路径上，调用方已无从补救。
    pub fn release(self) {
        if let PipelineMessage::Buffer(buf) = self {
            if let Err(err) = buf.release() {
                tracing::warn!(error.code = err.code(), error = %err, "failed to release message");
            }
        }
    }

    /// 记录访问提示，便于泄漏排查。
    pub fn touch(&self, hint: &'static str) {
        if let PipelineMessage::Buffer(buf) = self {
            buf.touch(hint);
        }
    }
}

impl From<ByteBuf> for PipelineMessage {
    fn from(buf: ByteBuf) -> Self {
        PipelineMessage::Buffer(buf)
    }
}

impl fmt::Debug for PipelineMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineMessage::Buffer(buf) => f
                .debug_tuple("Buffer")
                .field(&buf.readable_bytes())
                .finish(),
            PipelineMessage::User(_) => f.debug_tuple("User").field(&"<erased-user>").finish(),
        }
    }
}

/// 出站消息的字节数估算器。
///
/// # 契约说明（What）
/// - 返回值为估算的字节成本；负数表示“无法估算”，调用方一律按 0 处理，从而不会阻塞可写性；
/// - 估算结果在写入时刻捕获并随出站条目保存，后续不会重新询问。
pub trait MessageSizeEstimator: Send + Sync + 'static {
    fn size(&self, msg: &PipelineMessage) -> i64;
}

/// 默认估算器：字节缓冲取可读字节数，业务对象取 `unknown_size`。
#[derive(Clone, Copy, Debug)]
pub struct DefaultMessageSizeEstimator {
    unknown_size: i64,
}

impl DefaultMessageSizeEstimator {
    pub const fn new(unknown_size: i64) -> Self {
        Self { unknown_size }
    }
}

impl Default for DefaultMessageSizeEstimator {
    fn default() -> Self {
        Self::new(-1)
    }
}

impl MessageSizeEstimator for DefaultMessageSizeEstimator {
    fn size(&self, msg: &PipelineMessage) -> i64 {
        match msg {
            PipelineMessage::Buffer(buf) => buf.readable_bytes() as i64,
            PipelineMessage::User(_) => self.unknown_size,
        }
    }
}

/// 把估算结果规整为非负字节数。
pub(crate) fn clamp_size(estimated: i64) -> u64 {
    estimated.max(0) as u64
}

/// 输出方向半关闭完成后触发的用户事件。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelOutputShutdownEvent;
