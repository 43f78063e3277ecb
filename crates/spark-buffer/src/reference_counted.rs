use crate::BufferError;

/// `ReferenceCounted` 描述显式引用计数对象的 retain/release 契约。
///
/// # 设计动机（Why）
/// - 通道核心在失败路径上（写入被拒、出站缓冲关闭、流水线尾部丢弃）必须释放消息，
///   否则池化实现会泄漏容量；该 trait 让核心无需知道具体缓冲类型即可履行释放义务。
///
/// # 契约说明（What）
/// - 新建对象的计数为 1；`retain` 增加计数，`release` 减少计数；
/// - 计数归零时对象被回收，`release` 返回 `Ok(true)`；此后任何 retain/release 均返回
///   [`BufferError::IllegalReferenceCount`]；
/// - `touch` 只记录调试提示，不改变计数。
///
/// # 风险提示（Trade-offs）
/// - 计数与 Rust 所有权相互独立：丢弃一个句柄并不会自动释放计数，调用方需遵守“谁持有谁释放”的约定。
pub trait ReferenceCounted {
    /// 当前引用计数。
    fn ref_cnt(&self) -> usize;

    /// 计数增加 `increment`。
    fn retain_by(&self, increment: usize) -> Result<(), BufferError>;

    /// 计数减少 `decrement`，归零时返回 `Ok(true)`。
    fn release_by(&self, decrement: usize) -> Result<bool, BufferError>;

    /// 记录最近一次访问提示，供泄漏排查使用。
    fn touch(&self, hint: &'static str);

    fn retain(&self) -> Result<(), BufferError> {
        self.retain_by(1)
    }

    fn release(&self) -> Result<bool, BufferError> {
        self.release_by(1)
    }
}
