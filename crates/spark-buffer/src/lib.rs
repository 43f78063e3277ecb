//! `spark-buffer` 提供通道核心消费的字节容器协作者。
//!
//! # 模块定位（Why）
//! - 通道核心只关心两件事：出站消息的“可读字节数估算”与“retain/release 引用计数契约”；
//!   具体的内存分配算法（池化/非池化）不在核心职责之内。
//! - 本 crate 以 `bytes::Bytes` 片段为底座，落地一个可组合、零拷贝切片、显式引用计数的
//!   [`ByteBuf`]，供流水线、出站缓冲与合并队列直接使用。
//!
//! # 设计概要（How）
//! - [`ReferenceCounted`] 描述 retain/release/touch 契约，计数归零后缓冲不可再访问；
//! - [`ByteBuf`] 内部维护 `VecDeque<Bytes>` 片段序列，既能表示连续缓冲，也能表示复合缓冲；
//! - `Clone` 语义等价于“共享计数的浅复制”（duplicate），不会增加计数；需要独立所有权时使用
//!   [`ByteBuf::retained_duplicate`] 或 [`ByteBuf::read_retained_slice`]。
//!
//! # 命名约定（Consistency）
//! - 方法名沿用常见的字节缓冲术语：`readable_bytes`、`retained_duplicate`、`compose` 等。

mod byte_buf;
mod error;
mod reference_counted;

pub use byte_buf::ByteBuf;
pub use error::{BufferError, codes};
pub use reference_counted::ReferenceCounted;
