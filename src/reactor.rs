//! 反应器能力接口
//!
//! 容器只通过这个接口驱动 I/O：发起连接、监听端口、处理一轮事件。
//! 轮询机制、套接字和 TLS 握手都在实现方内部完成。

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::{
    address::AmqpUrl,
    engine::{ConnectionHandle, DeliveryHandle, LinkHandle, RemoteOutcome, SessionHandle, Condition},
    error::EngineError,
    tls::TlsDomain,
};

/// 监听器句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AcceptorHandle(u64);

impl AcceptorHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AcceptorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "acceptor-{}", self.0)
    }
}

/// 一次连接尝试的完整传输参数
#[derive(Debug, Clone)]
pub struct TransportTarget {
    pub url: AmqpUrl,
    /// `amqps` 时必定存在
    pub tls: Option<TlsDomain>,
    /// TLS 校验用的对端主机名
    pub sni: Option<String>,
    pub heartbeat: Option<Duration>,
    pub virtual_host: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub sasl_enabled: bool,
    pub allowed_mechs: Option<String>,
    pub allow_insecure_mechs: bool,
}

impl TransportTarget {
    pub fn host(&self) -> &str {
        self.url.host()
    }

    pub fn port(&self) -> u16 {
        self.url.port()
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// `host:port`
    pub fn authority(&self) -> String {
        format!("{}:{}", self.url.host(), self.url.port())
    }
}

/// 反应器报告的异步事件
#[derive(Debug, Clone, PartialEq)]
pub enum ReactorEvent {
    /// 对端已打开连接，握手完成
    ConnectionRemoteOpen { connection: ConnectionHandle },
    ConnectionRemoteClose {
        connection: ConnectionHandle,
        condition: Option<Condition>,
    },
    /// 传输层断开；`error` 为 `None` 表示正常关闭
    TransportClosed {
        connection: ConnectionHandle,
        error: Option<String>,
    },
    /// 监听器接受了一个入站连接
    ConnectionAccepted {
        acceptor: AcceptorHandle,
        connection: ConnectionHandle,
    },
    SessionRemoteOpen { session: SessionHandle },
    SessionRemoteClose {
        session: SessionHandle,
        condition: Option<Condition>,
    },
    LinkRemoteOpen { link: LinkHandle },
    LinkRemoteClose {
        link: LinkHandle,
        condition: Option<Condition>,
    },
    /// 对端结算了一个投递
    DeliverySettled {
        link: LinkHandle,
        delivery: DeliveryHandle,
        outcome: RemoteOutcome,
    },
}

impl ReactorEvent {
    pub fn connection(&self) -> Option<ConnectionHandle> {
        match self {
            ReactorEvent::ConnectionRemoteOpen { connection }
            | ReactorEvent::ConnectionRemoteClose { connection, .. }
            | ReactorEvent::TransportClosed { connection, .. }
            | ReactorEvent::ConnectionAccepted { connection, .. } => Some(*connection),
            _ => None,
        }
    }
}

/// 反应器能力
///
/// `connect` 只发起连接，不等待握手完成；结果通过 `process` 返回的事件观察。
#[async_trait]
pub trait Reactor: Send {
    async fn connect(&mut self, connection: ConnectionHandle, target: TransportTarget) -> Result<(), EngineError>;

    async fn listen(&mut self, host: &str, port: u16, tls: Option<TlsDomain>) -> Result<AcceptorHandle, EngineError>;

    async fn close_acceptor(&mut self, acceptor: AcceptorHandle) -> Result<(), EngineError>;

    /// 处理一轮事件，最多等待 `timeout`；`None` 表示等到有事件为止
    async fn process(&mut self, timeout: Option<Duration>) -> Result<Vec<ReactorEvent>, EngineError>;

    /// 唤醒正在 `process` 中等待的事件循环
    fn wakeup(&self);
}
