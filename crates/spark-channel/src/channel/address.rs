use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// 通道端点地址。
///
/// - `Inet`：IP 套接字地址；
/// - `Local`：进程内或域套接字等以名称标识的端点。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SocketAddress {
    Inet(SocketAddr),
    Local(Arc<str>),
}

impl SocketAddress {
    pub fn local(name: impl Into<Arc<str>>) -> Self {
        SocketAddress::Local(name.into())
    }
}

impl From<SocketAddr> for SocketAddress {
    fn from(addr: SocketAddr) -> Self {
        SocketAddress::Inet(addr)
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketAddress::Inet(addr) => write!(f, "{addr}"),
            SocketAddress::Local(name) => write!(f, "local:{name}"),
        }
    }
}
