//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为通道生命周期、流水线、事件循环、出站缓冲提供统一错误域 [`ChannelError`]；
//! - 同一故障经常需要扇出到多个 Promise（关闭时所有挂起写入以同一原因失败），因此错误类型必须 `Clone`。
//!
//! ## 设计要求（What）
//! - 每个变体通过 [`ChannelError::code`] 暴露 `<领域>.<语义>` 形式的稳定错误码；
//! - 生命周期失败通过 Promise 传递，编程错误（重名、复用、非法配置）在调用点同步返回 `Err`；
//! - 外部错误（传输层 I/O、处理器业务错误）以 `Arc<dyn Error>` 保存，保留 `source()` 链。

use std::borrow::Cow;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use spark_buffer::BufferError;
use thiserror::Error;

/// 通道核心的稳定错误码集合。
///
/// # 契约说明（What）
/// - 命名遵循 `<领域>.<语义>`，与日志字段 `error.code` 一一对应；
/// - 新增错误码只能追加，不得复用或修改既有字符串。
pub mod codes {
    pub const CHANNEL_CLOSED: &str = "channel.closed";
    pub const CHANNEL_NOT_YET_CONNECTED: &str = "channel.not_yet_connected";
    pub const CHANNEL_INCOMPATIBLE_EVENT_LOOP: &str = "channel.incompatible_event_loop";
    pub const CHANNEL_ALREADY_REGISTERED: &str = "channel.already_registered";
    pub const CHANNEL_CONNECT_TIMEOUT: &str = "channel.connect_timeout";
    pub const CHANNEL_CONNECTION_PENDING: &str = "channel.connection_pending";
    pub const CHANNEL_OUTPUT_SHUTDOWN: &str = "channel.output_shutdown";
    pub const PIPELINE_HANDLER_ALREADY_ADDED: &str = "pipeline.handler_already_added";
    pub const PIPELINE_DUPLICATE_NAME: &str = "pipeline.duplicate_name";
    pub const PIPELINE_HANDLER_NOT_FOUND: &str = "pipeline.handler_not_found";
    pub const PIPELINE_HANDLER_ADDED_FAILED: &str = "pipeline.handler_added_failed";
    pub const PIPELINE_HANDLER_REMOVED_FAILED: &str = "pipeline.handler_removed_failed";
    pub const PIPELINE_DESTROYED: &str = "pipeline.destroyed";
    pub const EXECUTOR_REJECTED: &str = "executor.rejected";
    pub const EXECUTOR_BLOCKING_ON_EVENT_LOOP: &str = "executor.blocking_on_event_loop";
    pub const PROMISE_CANCELLED: &str = "promise.cancelled";
    pub const PROMISE_ALREADY_COMPLETED: &str = "promise.already_completed";
    pub const PROMISE_VOID: &str = "promise.void";
    pub const OUTBOUND_PENDING_BYTES_OVERFLOW: &str = "outbound.pending_bytes_overflow";
    pub const CONFIG_INVALID: &str = "config.invalid";
    pub const TRANSPORT_IO: &str = "transport.io";
    pub const HANDLER_FAILURE: &str = "handler.failure";
}

/// 共享的外部错误源。
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// 通道核心错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：覆盖通道关闭、未连接、事件循环不兼容、重复注册、处理器复用、流水线销毁等核心故障，
///   并为外部传输与处理器业务失败提供承载变体；
/// - **契约 (What)**：
///   - 所有变体 `Send + Sync + Clone`，可安全扇出到多个 Promise；
///   - `Transport`/`Handler` 的 `source` 保留原始错误，供调用方 downcast；
/// - **设计权衡 (Trade-offs)**：上下文使用 `String` 保存处理器名称，牺牲少量分配换取可读的诊断信息。
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,
    #[error("channel is not yet connected")]
    NotYetConnected,
    #[error("event loop is incompatible with this channel")]
    IncompatibleEventLoop,
    #[error("channel is already registered to an event loop")]
    AlreadyRegistered,
    #[error("handler `{handler}` is not sharable and was already added to a pipeline")]
    HandlerAlreadyAdded { handler: String },
    #[error("duplicate handler name: {name}")]
    DuplicateHandlerName { name: String },
    #[error("no handler named `{name}` in the pipeline")]
    HandlerNotFound { name: String },
    #[error("{name}.handler_added() failed (handler removed: {removed})")]
    HandlerAddedFailed {
        name: String,
        removed: bool,
        #[source]
        cause: Box<ChannelError>,
    },
    #[error("{name}.handler_removed() failed")]
    HandlerRemovedFailed {
        name: String,
        #[source]
        cause: Box<ChannelError>,
    },
    #[error("exception raised while tearing down handler `{name}` of a destroyed pipeline")]
    PipelineDestroyed {
        name: String,
        #[source]
        cause: Box<ChannelError>,
    },
    #[error("event executor rejected the task (shutting down)")]
    RejectedExecution,
    #[error("blocking wait on the owning event loop would dead-lock")]
    BlockingOnEventLoop,
    #[error("promise was cancelled")]
    Cancelled,
    #[error("promise is already completed")]
    PromiseAlreadyCompleted,
    #[error("void promise cannot be observed")]
    VoidPromise,
    #[error("connection timed out after {timeout:?}: {remote}")]
    ConnectTimeout { remote: String, timeout: Duration },
    #[error("a connection attempt is already pending")]
    ConnectionPending,
    #[error("channel output is shut down")]
    OutputShutdown {
        #[source]
        cause: Option<Box<ChannelError>>,
    },
    #[error("pending outbound bytes overflow: {pending} + {size}")]
    PendingBytesOverflow { pending: u64, size: u64 },
    #[error("invalid channel configuration: {message}")]
    InvalidConfig { message: Cow<'static, str> },
    #[error("transport failure: {source}")]
    Transport {
        #[source]
        source: SharedError,
    },
    #[error("handler failure: {message}")]
    Handler {
        message: Cow<'static, str>,
        #[source]
        source: Option<SharedError>,
    },
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

impl ChannelError {
    /// 包装传输层错误（I/O 等）。
    pub fn transport(source: impl StdError + Send + Sync + 'static) -> Self {
        ChannelError::Transport {
            source: Arc::new(source),
        }
    }

    /// 处理器业务错误，无底层来源。
    pub fn handler(message: impl Into<Cow<'static, str>>) -> Self {
        ChannelError::Handler {
            message: message.into(),
            source: None,
        }
    }

    /// 处理器业务错误，携带底层来源。
    pub fn handler_with_source(
        message: impl Into<Cow<'static, str>>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        ChannelError::Handler {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    pub fn invalid_config(message: impl Into<Cow<'static, str>>) -> Self {
        ChannelError::InvalidConfig {
            message: message.into(),
        }
    }

    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            ChannelError::Closed => codes::CHANNEL_CLOSED,
            ChannelError::NotYetConnected => codes::CHANNEL_NOT_YET_CONNECTED,
            ChannelError::IncompatibleEventLoop => codes::CHANNEL_INCOMPATIBLE_EVENT_LOOP,
            ChannelError::AlreadyRegistered => codes::CHANNEL_ALREADY_REGISTERED,
            ChannelError::HandlerAlreadyAdded { .. } => codes::PIPELINE_HANDLER_ALREADY_ADDED,
            ChannelError::DuplicateHandlerName { .. } => codes::PIPELINE_DUPLICATE_NAME,
            ChannelError::HandlerNotFound { .. } => codes::PIPELINE_HANDLER_NOT_FOUND,
            ChannelError::HandlerAddedFailed { .. } => codes::PIPELINE_HANDLER_ADDED_FAILED,
            ChannelError::HandlerRemovedFailed { .. } => codes::PIPELINE_HANDLER_REMOVED_FAILED,
            ChannelError::PipelineDestroyed { .. } => codes::PIPELINE_DESTROYED,
            ChannelError::RejectedExecution => codes::EXECUTOR_REJECTED,
            ChannelError::BlockingOnEventLoop => codes::EXECUTOR_BLOCKING_ON_EVENT_LOOP,
            ChannelError::Cancelled => codes::PROMISE_CANCELLED,
            ChannelError::PromiseAlreadyCompleted => codes::PROMISE_ALREADY_COMPLETED,
            ChannelError::VoidPromise => codes::PROMISE_VOID,
            ChannelError::ConnectTimeout { .. } => codes::CHANNEL_CONNECT_TIMEOUT,
            ChannelError::ConnectionPending => codes::CHANNEL_CONNECTION_PENDING,
            ChannelError::OutputShutdown { .. } => codes::CHANNEL_OUTPUT_SHUTDOWN,
            ChannelError::PendingBytesOverflow { .. } => codes::OUTBOUND_PENDING_BYTES_OVERFLOW,
            ChannelError::InvalidConfig { .. } => codes::CONFIG_INVALID,
            ChannelError::Transport { .. } => codes::TRANSPORT_IO,
            ChannelError::Handler { .. } => codes::HANDLER_FAILURE,
            ChannelError::Buffer(err) => err.code(),
        }
    }

    /// 是否为 Promise 被取消。
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChannelError::Cancelled)
    }
}

/// 通道核心统一结果类型。
pub type Result<T, E = ChannelError> = core::result::Result<T, E>;
