//! 可观测性辅助：统一日志字段键名。
//!
//! 库本身不安装任何 `tracing` 订阅者；宿主进程自行决定输出格式与采样策略。

pub mod keys;
