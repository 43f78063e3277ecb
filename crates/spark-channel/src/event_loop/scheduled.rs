use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::Task;

/// 延时任务句柄。
///
/// 取消只影响尚未执行的任务；任务一旦出队执行，`cancel` 不再产生效果。
#[derive(Clone, Debug)]
pub struct ScheduledHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledHandle {
    /// 取消任务；返回本次调用是否完成了取消。
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct ScheduledTask<D> {
    deadline: D,
    seq: u64,
    task: Task,
    cancelled: Arc<AtomicBool>,
}

impl<D: Ord> PartialEq for ScheduledTask<D> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<D: Ord> Eq for ScheduledTask<D> {}

impl<D: Ord> PartialOrd for ScheduledTask<D> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<D: Ord> Ord for ScheduledTask<D> {
    // BinaryHeap 是大顶堆，反转后最早到期、最早提交的任务位于堆顶。
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// 按 (截止时间, 提交序号) 排序的定时任务队列。
///
/// `D` 为时间刻度：真实事件循环使用 `Instant`，嵌入式事件循环使用虚拟时钟 `Duration`。
pub(crate) struct TimerQueue<D> {
    heap: BinaryHeap<ScheduledTask<D>>,
    next_seq: u64,
}

impl<D: Ord + Copy> TimerQueue<D> {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn push(&mut self, deadline: D, task: Task) -> ScheduledHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(ScheduledTask {
            deadline,
            seq,
            task,
            cancelled: Arc::clone(&cancelled),
        });
        ScheduledHandle { cancelled }
    }

    fn discard_cancelled_head(&mut self) {
        while self
            .heap
            .peek()
            .is_some_and(|head| head.cancelled.load(Ordering::Acquire))
        {
            self.heap.pop();
        }
    }

    /// 取出一个已到期且未取消的任务。
    pub(crate) fn pop_due(&mut self, now: D) -> Option<Task> {
        self.discard_cancelled_head();
        if self.heap.peek().is_some_and(|head| head.deadline <= now) {
            return self.heap.pop().map(|scheduled| scheduled.task);
        }
        None
    }

    pub(crate) fn next_deadline(&mut self) -> Option<D> {
        self.discard_cancelled_head();
        self.heap.peek().map(|head| head.deadline)
    }

    /// 取消并丢弃全部定时任务。
    pub(crate) fn cancel_all(&mut self) -> usize {
        let drained = self.heap.len();
        for scheduled in self.heap.drain() {
            scheduled.cancelled.store(true, Ordering::Release);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn equal_deadlines_keep_submission_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut timers = TimerQueue::new();
        for (deadline, tag) in [(5u64, "b"), (1, "a"), (5, "c")] {
            let order = Arc::clone(&order);
            timers.push(deadline, Box::new(move || order.lock().unwrap().push(tag)));
        }
        while let Some(task) = timers.pop_due(10) {
            task();
        }
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn cancelled_tasks_are_skipped() {
        let mut timers = TimerQueue::new();
        let handle = timers.push(1u64, Box::new(|| panic!("已取消任务不应执行")));
        timers.push(2, Box::new(|| {}));
        assert!(handle.cancel());
        assert!(!handle.cancel(), "重复取消返回 false");
        assert_eq!(timers.next_deadline(), Some(2));
        assert!(timers.pop_due(1).is_none());
        assert!(timers.pop_due(2).is_some());
        assert_eq!(timers.next_deadline(), None);
    }
}
