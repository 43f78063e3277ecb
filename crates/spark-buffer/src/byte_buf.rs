use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use spin::Mutex;

use crate::{BufferError, ReferenceCounted};

/// 共享引用计数单元。
///
/// 同一份逻辑缓冲的所有浅复制句柄（`Clone`、`read_retained_slice` 产物）共享同一个计数器；
/// 复合缓冲额外持有各组成部分的计数器，在自身归零时逐一释放。
struct RefCounter {
    count: AtomicUsize,
    hint: Mutex<Option<&'static str>>,
    components: Mutex<Vec<Arc<RefCounter>>>,
}

impl RefCounter {
    fn new(components: Vec<Arc<RefCounter>>) -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(1),
            hint: Mutex::new(None),
            components: Mutex::new(components),
        })
    }

    fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn retain_by(&self, increment: usize) -> Result<(), BufferError> {
        let mut current = self.get();
        loop {
            let illegal = BufferError::IllegalReferenceCount {
                ref_cnt: current,
                delta: increment as isize,
            };
            if current == 0 {
                return Err(illegal);
            }
            let next = current.checked_add(increment).ok_or(illegal)?;
            match self.count.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    fn release_by(&self, decrement: usize) -> Result<bool, BufferError> {
        let mut current = self.get();
        loop {
            if current == 0 || decrement > current {
                return Err(BufferError::IllegalReferenceCount {
                    ref_cnt: current,
                    delta: -(decrement as isize),
                });
            }
            let next = current - decrement;
            match self.count.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if next == 0 {
                        self.deallocate();
                        return Ok(true);
                    }
                    return Ok(false);
                }
                Err(observed) => current = observed,
            }
        }
    }

    fn deallocate(&self) {
        let components = core::mem::take(&mut *self.components.lock());
        for component in components {
            // 组成部分的所有权在组合时已转移给复合缓冲，这里只归还那一次计数。
            let _ = component.release_by(1);
        }
    }
}

/// `ByteBuf` 是通道核心使用的引用计数字节容器。
///
/// # 设计动机（Why）
/// - 出站路径需要“按字节估算大小 + 失败时释放”的消息形态，入站路径需要零拷贝切片与拼接；
/// - 合并队列需要把多个小缓冲组合为一个大缓冲（复合），或按字节数从复合缓冲中切出帧。
///
/// # 架构关系（How）
/// - `chunks` 保存可读区间的 `Bytes` 片段序列，`len` 缓存总可读字节数；
/// - `counter` 为共享引用计数，`Clone` 只复制句柄，不改变计数；
/// - 复合缓冲通过 [`ByteBuf::compose`] 或 [`ByteBuf::append`] 获得，组成部分的计数随复合缓冲一起释放。
///
/// # 契约说明（What）
/// - 计数归零后，所有读取类方法返回 [`BufferError::IllegalReferenceCount`]；
/// - `readable_bytes` 在任何状态下都返回句柄视角的剩余字节数，便于大小估算器无条件调用。
#[derive(Clone)]
pub struct ByteBuf {
    chunks: VecDeque<Bytes>,
    len: usize,
    counter: Arc<RefCounter>,
}

impl ByteBuf {
    /// 创建空缓冲，计数为 1。
    pub fn new() -> Self {
        Self::from_chunks(VecDeque::new(), RefCounter::new(Vec::new()))
    }

    /// 以静态字节构造缓冲，不发生拷贝。
    pub fn from_static(bytes: &'static [u8]) -> Self {
        Self::from(Bytes::from_static(bytes))
    }

    /// 拷贝切片内容构造缓冲。
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self::from(Bytes::copy_from_slice(data))
    }

    fn from_chunks(chunks: VecDeque<Bytes>, counter: Arc<RefCounter>) -> Self {
        let len = chunks.iter().map(Bytes::len).sum();
        Self {
            chunks,
            len,
            counter,
        }
    }

    /// 可读字节数。
    pub fn readable_bytes(&self) -> usize {
        self.len
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 计数是否仍大于零。
    pub fn is_accessible(&self) -> bool {
        self.counter.get() > 0
    }

    /// 当前由多少个物理片段组成；连续缓冲为 0 或 1。
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// 两个句柄是否共享同一引用计数（即同一逻辑缓冲的不同视图）。
    pub fn shares_counter_with(&self, other: &ByteBuf) -> bool {
        Arc::ptr_eq(&self.counter, &other.counter)
    }

    fn ensure_accessible(&self) -> Result<(), BufferError> {
        let ref_cnt = self.counter.get();
        if ref_cnt == 0 {
            return Err(BufferError::IllegalReferenceCount { ref_cnt, delta: 0 });
        }
        Ok(())
    }

    fn ensure_readable(&self, requested: usize) -> Result<(), BufferError> {
        self.ensure_accessible()?;
        if requested > self.len {
            return Err(BufferError::OutOfBounds {
                requested,
                available: self.len,
            });
        }
        Ok(())
    }

    /// 以片段形式遍历可读区间，适用于 `writev` 风格的聚集写。
    pub fn chunks(&self) -> Result<impl Iterator<Item = &Bytes>, BufferError> {
        self.ensure_accessible()?;
        Ok(self.chunks.iter())
    }

    /// 拷贝全部可读字节。
    pub fn to_vec(&self) -> Result<Vec<u8>, BufferError> {
        self.ensure_accessible()?;
        let mut out = Vec::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        Ok(out)
    }

    /// 转换为连续的 `Bytes`；单片段时零拷贝。
    pub fn to_bytes(&self) -> Result<Bytes, BufferError> {
        self.ensure_accessible()?;
        match self.chunks.len() {
            0 => Ok(Bytes::new()),
            1 => Ok(self.chunks[0].clone()),
            _ => {
                let mut joined = BytesMut::with_capacity(self.len);
                for chunk in &self.chunks {
                    joined.extend_from_slice(chunk);
                }
                Ok(joined.freeze())
            }
        }
    }

    /// 丢弃前 `len` 个可读字节。
    pub fn skip_bytes(&mut self, len: usize) -> Result<(), BufferError> {
        self.ensure_readable(len)?;
        let _ = self.split_front(len);
        Ok(())
    }

    /// 切出前 `len` 个字节作为新视图，并为其 retain 一次计数。
    ///
    /// 返回的视图与原缓冲共享计数器：调用方需各自释放一次。
    pub fn read_retained_slice(&mut self, len: usize) -> Result<ByteBuf, BufferError> {
        self.ensure_readable(len)?;
        self.counter.retain_by(1)?;
        let front = self.split_front(len);
        Ok(Self::from_chunks(front, Arc::clone(&self.counter)))
    }

    /// 复制句柄并 retain 一次计数。
    pub fn retained_duplicate(&self) -> Result<ByteBuf, BufferError> {
        self.counter.retain_by(1)?;
        Ok(self.clone())
    }

    fn split_front(&mut self, mut len: usize) -> VecDeque<Bytes> {
        let mut front = VecDeque::new();
        self.len -= len;
        while len > 0 {
            let Some(mut chunk) = self.chunks.pop_front() else {
                break;
            };
            if chunk.len() <= len {
                len -= chunk.len();
                front.push_back(chunk);
            } else {
                front.push_back(chunk.split_to(len));
                self.chunks.push_front(chunk);
                len = 0;
            }
        }
        front
    }

    /// 以零拷贝方式把多个缓冲组合为一个复合缓冲。
    ///
    /// # 契约说明（What）
    /// - 组成部分各自的一次计数转移给复合缓冲：复合缓冲计数归零时逐一释放；
    /// - 任一组成部分已不可访问时，释放其余组成部分并返回错误。
    pub fn compose(components: impl IntoIterator<Item = ByteBuf>) -> Result<ByteBuf, BufferError> {
        let components: Vec<ByteBuf> = components.into_iter().collect();
        if let Some(broken) = components.iter().find(|c| !c.is_accessible()) {
            let err = BufferError::IllegalReferenceCount {
                ref_cnt: broken.counter.get(),
                delta: 0,
            };
            for component in components.iter().filter(|c| c.is_accessible()) {
                let _ = component.release();
            }
            return Err(err);
        }
        let mut chunks = VecDeque::new();
        let mut counters = Vec::with_capacity(components.len());
        for component in components {
            chunks.extend(component.chunks);
            counters.push(component.counter);
        }
        Ok(Self::from_chunks(chunks, RefCounter::new(counters)))
    }

    /// 拷贝拼接多个缓冲为一个连续缓冲，并释放全部组成部分。
    pub fn concat_copy(components: impl IntoIterator<Item = ByteBuf>) -> Result<ByteBuf, BufferError> {
        let components: Vec<ByteBuf> = components.into_iter().collect();
        let total = components.iter().map(ByteBuf::readable_bytes).sum();
        let mut joined = BytesMut::with_capacity(total);
        let mut failure = None;
        for component in &components {
            match component.ensure_accessible() {
                Ok(()) => {
                    for chunk in &component.chunks {
                        joined.extend_from_slice(chunk);
                    }
                }
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        for component in components.iter().filter(|c| c.is_accessible()) {
            let _ = component.release();
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(ByteBuf::from(joined.freeze())),
        }
    }

    /// 把 `other` 作为新组成部分追加到当前缓冲尾部（零拷贝）。
    ///
    /// `other` 的一次计数转移给 `self`。
    pub fn append(&mut self, other: ByteBuf) -> Result<(), BufferError> {
        self.ensure_accessible()?;
        other.ensure_accessible()?;
        self.len += other.len;
        self.chunks.extend(other.chunks);
        self.counter.components.lock().push(other.counter);
        Ok(())
    }

    /// 最近一次 `touch` 记录的提示。
    pub fn last_touch(&self) -> Option<&'static str> {
        *self.counter.hint.lock()
    }
}

impl Default for ByteBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Bytes> for ByteBuf {
    fn from(bytes: Bytes) -> Self {
        let mut chunks = VecDeque::with_capacity(1);
        if !bytes.is_empty() {
            chunks.push_back(bytes);
        }
        Self::from_chunks(chunks, RefCounter::new(Vec::new()))
    }
}

impl From<Vec<u8>> for ByteBuf {
    fn from(data: Vec<u8>) -> Self {
        Self::from(Bytes::from(data))
    }
}

impl From<&'static str> for ByteBuf {
    fn from(data: &'static str) -> Self {
        Self::from_static(data.as_bytes())
    }
}

impl ReferenceCounted for ByteBuf {
    fn ref_cnt(&self) -> usize {
        self.counter.get()
    }

    fn retain_by(&self, increment: usize) -> Result<(), BufferError> {
        self.counter.retain_by(increment)
    }

    fn release_by(&self, decrement: usize) -> Result<bool, BufferError> {
        self.counter.release_by(decrement)
    }

    fn touch(&self, hint: &'static str) {
        *self.counter.hint.lock() = Some(hint);
    }
}

impl fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuf")
            .field("readable_bytes", &self.len)
            .field("chunks", &self.chunks.len())
            .field("ref_cnt", &self.counter.get())
            .finish()
    }
}
