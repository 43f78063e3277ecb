use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::{Channel, ChannelId};

/// 事件循环上的已注册通道表。
///
/// 注册成功时加入、注销完成时移除；表中持有强引用，保证已注册通道在无外部句柄时仍然存活。
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<BTreeMap<ChannelId, Arc<Channel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, channel: Arc<Channel>) {
        self.channels.lock().insert(channel.id(), channel);
    }

    pub(crate) fn remove(&self, id: &ChannelId) -> Option<Arc<Channel>> {
        self.channels.lock().remove(id)
    }

    pub fn contains(&self, id: &ChannelId) -> bool {
        self.channels.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// 按通道标识排序的快照。
    pub fn snapshot(&self) -> Vec<Arc<Channel>> {
        self.channels.lock().values().cloned().collect()
    }

    /// 清空并在锁外释放强引用，避免通道析构时回调本表造成自锁。
    pub(crate) fn clear(&self) {
        let drained = std::mem::take(&mut *self.channels.lock());
        drop(drained);
    }
}
