use super::{Channel, SocketAddress};
use crate::error::{ChannelError, Result};
use crate::event_loop::EventLoop;
use crate::message::PipelineMessage;
use crate::outbound::ChannelOutboundBuffer;

/// 传输类型的静态描述。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelMetadata {
    /// 是否具备独立于关闭的断开语义（如无连接协议的“解除关联”）。
    ///
    /// 为 `false` 时流水线把 `disconnect` 透明地转换为 `close`。
    pub has_disconnect: bool,
    /// 建议的单轮最大读取消息数。
    pub default_max_messages_per_read: u32,
}

impl ChannelMetadata {
    pub const fn new(has_disconnect: bool) -> Self {
        Self {
            has_disconnect,
            default_max_messages_per_read: 1,
        }
    }

    pub const fn with_max_messages_per_read(mut self, max: u32) -> Self {
        self.default_max_messages_per_read = max;
        self
    }
}

/// `do_connect` 的即时结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// 连接已建立。
    Connected,
    /// 连接进行中，完成时由传输层调用 [`ChannelUnsafe::finish_connect`](super::ChannelUnsafe::finish_connect)。
    Pending,
}

/// 被 [`Transport::filter_outbound_message`] 拒绝的消息，连同拒绝原因一并交还。
#[derive(Debug)]
pub struct RejectedMessage {
    pub message: PipelineMessage,
    pub cause: ChannelError,
}

/// `Transport` 是具体传输实现必须提供的底层钩子。
///
/// # 教案式说明
/// - **意图 (Why)**：通道的生命周期状态机与出站缓冲是通用的，真正的 I/O 动作由具体传输完成；
///   以组合方式注入钩子，而不是继承抽象基类；
/// - **契约 (What)**：
///   - 全部钩子只会在通道所属的事件循环上被调用；
///   - `do_write` 在出站缓冲的结构锁内执行：实现只能操作传入的缓冲，不得回调通道或流水线的写路径；
///   - 返回 `Err` 表示该步骤失败，通道负责完成对应 Promise 并决定是否关闭；
///   - `is_open`/`is_active` 必须可在任意线程无锁读取；
/// - **风险 (Trade-offs)**：`do_disconnect`、`do_shutdown_output` 等提供保守默认值，
///   不支持的传输无需关心。
pub trait Transport: Send + Sync + 'static {
    fn metadata(&self) -> ChannelMetadata;

    fn is_open(&self) -> bool;

    fn is_active(&self) -> bool;

    /// 通道能否注册到该事件循环；实现通常通过 `&dyn Any` 向下转型判断具体类型。
    fn is_compatible(&self, event_loop: &dyn EventLoop) -> bool;

    fn local_address(&self) -> Option<SocketAddress>;

    fn remote_address(&self) -> Option<SocketAddress>;

    fn do_register(&self, channel: &Channel) -> Result<()>;

    fn do_bind(&self, local: &SocketAddress) -> Result<()>;

    fn do_connect(&self, remote: &SocketAddress, local: Option<&SocketAddress>) -> Result<ConnectOutcome> {
        let _ = (remote, local);
        Err(ChannelError::transport(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "transport does not support connect",
        )))
    }

    fn do_finish_connect(&self) -> Result<()> {
        Ok(())
    }

    fn do_disconnect(&self) -> Result<()>;

    fn do_close(&self) -> Result<()>;

    /// 半关闭输出方向；默认直接关闭整个传输。
    fn do_shutdown_output(&self) -> Result<()> {
        self.do_close()
    }

    fn do_deregister(&self) -> Result<()> {
        Ok(())
    }

    fn do_begin_read(&self) -> Result<()>;

    /// 写出缓冲中的已刷新条目；可以只写出一部分，剩余条目留待下次 flush。
    fn do_write(&self, buffer: &mut ChannelOutboundBuffer) -> Result<()>;

    /// 入队前的消息校验与转换。
    fn filter_outbound_message(
        &self,
        msg: PipelineMessage,
    ) -> core::result::Result<PipelineMessage, RejectedMessage> {
        Ok(msg)
    }

    /// `auto_read` 被关闭时回调，传输可借此撤销已登记的读兴趣。
    fn auto_read_cleared(&self) {}
}
