use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ChannelError, Result};
use crate::future::{ChannelFuture, ChannelPromise};

struct CombinerState {
    expected: usize,
    completed: usize,
    cause: Option<ChannelError>,
    aggregate: Option<ChannelPromise>,
    finished: bool,
}

/// `PromiseCombiner` 把多个 Future 聚合为一个 Promise。
///
/// # 契约说明（What）
/// - `add` 必须在 `finish` 之前调用；`finish` 只能调用一次；
/// - 全部 Future 完成后聚合 Promise 才会完成：任一失败则以首个失败原因失败，否则成功；
/// - void Future 无法被观察，`add` 返回 [`ChannelError::VoidPromise`]。
#[derive(Clone)]
pub struct PromiseCombiner {
    state: Arc<Mutex<CombinerState>>,
}

impl PromiseCombiner {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CombinerState {
                expected: 0,
                completed: 0,
                cause: None,
                aggregate: None,
                finished: false,
            })),
        }
    }

    pub fn add(&self, future: &ChannelFuture) -> Result<()> {
        if future.is_void() {
            return Err(ChannelError::VoidPromise);
        }
        {
            let mut state = self.state.lock();
            if state.finished {
                return Err(ChannelError::PromiseAlreadyCompleted);
            }
            state.expected += 1;
        }
        let combiner = self.clone();
        future.add_listener(move |done| combiner.on_complete(done.cause()))
    }

    /// 绑定聚合 Promise；此后不再接受新的 Future。
    pub fn finish(&self, aggregate: ChannelPromise) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.finished {
                return Err(ChannelError::PromiseAlreadyCompleted);
            }
            state.finished = true;
            state.aggregate = Some(aggregate);
        }
        self.try_complete();
        Ok(())
    }

    fn on_complete(&self, cause: Option<ChannelError>) {
        {
            let mut state = self.state.lock();
            state.completed += 1;
            if state.cause.is_none() {
                state.cause = cause;
            }
        }
        self.try_complete();
    }

    fn try_complete(&self) {
        let (aggregate, cause) = {
            let mut state = self.state.lock();
            if !state.finished || state.completed < state.expected {
                return;
            }
            match state.aggregate.take() {
                Some(aggregate) => (aggregate, state.cause.clone()),
                None => return,
            }
        };
        match cause {
            Some(cause) => aggregate.try_failure(cause),
            None => aggregate.try_success(),
        };
    }
}

impl Default for PromiseCombiner {
    fn default() -> Self {
        Self::new()
    }
}
