//! 不可共享处理器的“已加入”登记。
//!
//! 以处理器实例地址为键、持有该实例的上下文标识为值。上下文移除或析构时按标识注销，
//! 标识不匹配的注销请求被忽略，因此一次失败的重复添加不会抹掉原持有者的登记。

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::ChannelHandler;
use crate::error::{ChannelError, Result};

static ADDED: Mutex<BTreeMap<usize, u64>> = parking_lot::const_mutex(BTreeMap::new());

fn key(handler: &Arc<dyn ChannelHandler>) -> usize {
    Arc::as_ptr(handler) as *const () as usize
}

/// 登记 `handler` 由 `token` 持有；不可共享实例已被持有时返回 [`ChannelError::HandlerAlreadyAdded`]。
pub(crate) fn claim(handler: &Arc<dyn ChannelHandler>, token: u64) -> Result<()> {
    if handler.is_sharable() {
        return Ok(());
    }
    let mut added = ADDED.lock();
    if added.contains_key(&key(handler)) {
        return Err(ChannelError::HandlerAlreadyAdded {
            handler: handler.type_name().to_owned(),
        });
    }
    added.insert(key(handler), token);
    Ok(())
}

pub(crate) fn release(handler: &Arc<dyn ChannelHandler>, token: u64) {
    if handler.is_sharable() {
        return;
    }
    let mut added = ADDED.lock();
    if added.get(&key(handler)) == Some(&token) {
        added.remove(&key(handler));
    }
}
