//! 日志字段键名契约。
//!
//! 教案式说明（Why）：被吞掉或降级处理的失败（拒绝执行、异常到达流水线尾部、`handler_removed` 失败等）
//! 只能通过日志暴露，键名必须稳定才能被日志平台聚合。
//! 契约定义（What）：`tracing` 宏中使用的点分字段名与此处常量逐字一致，测试据此断言日志内容。

/// 通道标识（短文本形式）。
pub const FIELD_CHANNEL_ID: &str = "channel.id";

/// 处理器在流水线中的名称。
pub const FIELD_HANDLER_NAME: &str = "handler.name";

/// 事件种类，如 `channel_read`、`exception_caught`。
pub const FIELD_EVENT_KIND: &str = "event.kind";

/// 稳定错误码，取自 [`ChannelError::code`](crate::ChannelError::code)。
pub const FIELD_ERROR_CODE: &str = "error.code";

/// 事件循环线程名。
pub const FIELD_EVENT_LOOP: &str = "event_loop.name";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_unique_and_dotted() {
        let keys = [
            FIELD_CHANNEL_ID,
            FIELD_HANDLER_NAME,
            FIELD_EVENT_KIND,
            FIELD_ERROR_CODE,
            FIELD_EVENT_LOOP,
        ];
        for (idx, key) in keys.iter().enumerate() {
            assert!(key.contains('.'), "{key} 应为点分形式");
            assert!(!keys[idx + 1..].contains(key), "{key} 重复");
        }
    }
}
