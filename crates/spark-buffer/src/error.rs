use thiserror::Error;

/// 字节容器的稳定错误码，遵循 `<领域>.<语义>` 约定。
pub mod codes {
    /// 引用计数非法：对已释放缓冲访问、过度释放或计数溢出。
    pub const BUFFER_ILLEGAL_REFERENCE_COUNT: &str = "buffer.illegal_reference_count";
    /// 读取或切片越过可读区间。
    pub const BUFFER_OUT_OF_BOUNDS: &str = "buffer.out_of_bounds";
}

/// `BufferError` 汇总 [`ByteBuf`](crate::ByteBuf) 与 [`ReferenceCounted`](crate::ReferenceCounted)
/// 契约被违反时的错误。
///
/// # 契约说明（What）
/// - `IllegalReferenceCount`：`ref_cnt` 为操作前观测到的计数，`delta` 为本次 retain(+)/release(-) 的增量；
/// - `OutOfBounds`：`requested` 为调用方请求的字节数，`available` 为当时的可读字节数；
/// - 通过 [`BufferError::code`] 获取稳定错误码，便于上层错误域折叠。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("illegal reference count: refCnt={ref_cnt}, delta={delta}")]
    IllegalReferenceCount { ref_cnt: usize, delta: isize },
    #[error("index out of bounds: requested {requested} bytes, {available} readable")]
    OutOfBounds { requested: usize, available: usize },
}

impl BufferError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            BufferError::IllegalReferenceCount { .. } => codes::BUFFER_ILLEGAL_REFERENCE_COUNT,
            BufferError::OutOfBounds { .. } => codes::BUFFER_OUT_OF_BOUNDS,
        }
    }
}
