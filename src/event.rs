use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::engine::{Condition, ConnectionHandle, DeliveryHandle, LinkHandle, RemoteOutcome, SessionHandle};
use crate::reactor::AcceptorHandle;

/// 容器层事件的统一抽象
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerEvent {
    /// 向某个地址发起了一次连接尝试
    ConnectionAttempt {
        connection: ConnectionHandle,
        connection_id: String,
        url: String,
        attempt: u32,
    },
    /// 对端打开了连接
    ConnectionOpened {
        connection: ConnectionHandle,
        connection_id: String,
    },
    ConnectionClosed {
        connection: ConnectionHandle,
        condition: Option<Condition>,
    },

    /// 传输层错误
    TransportError {
        connection: ConnectionHandle,
        error: String,
    },

    /// 重连事件
    ReconnectScheduled {
        connection: ConnectionHandle,
        connection_id: String,
        delay: Duration,
        attempt: u32,
    },
    ReconnectExhausted {
        connection: ConnectionHandle,
        connection_id: String,
        attempts: u32,
    },

    /// 服务器事件
    ConnectionAccepted {
        acceptor: AcceptorHandle,
        connection: ConnectionHandle,
    },

    /// 会话与链路事件
    SessionOpened {
        connection: ConnectionHandle,
        session: SessionHandle,
    },
    SessionClosed {
        connection: ConnectionHandle,
        session: SessionHandle,
        condition: Option<Condition>,
    },
    LinkOpened {
        connection: ConnectionHandle,
        link: LinkHandle,
    },
    LinkClosed {
        connection: ConnectionHandle,
        link: LinkHandle,
        condition: Option<Condition>,
    },
    DeliverySettled {
        connection: ConnectionHandle,
        link: LinkHandle,
        delivery: DeliveryHandle,
        outcome: RemoteOutcome,
    },

    /// 事务事件
    TransactionDeclared {
        connection: ConnectionHandle,
        txn_id: Bytes,
    },
    TransactionDeclareFailed { connection: ConnectionHandle },
    TransactionCommitted { connection: ConnectionHandle },
    TransactionCommitFailed { connection: ConnectionHandle },
    TransactionAborted { connection: ConnectionHandle },

    /// 容器已关闭
    ContainerClosed,
}

impl ContainerEvent {
    /// 获取事件相关的连接
    pub fn connection(&self) -> Option<ConnectionHandle> {
        match self {
            ContainerEvent::ConnectionAttempt { connection, .. }
            | ContainerEvent::ConnectionOpened { connection, .. }
            | ContainerEvent::ConnectionClosed { connection, .. }
            | ContainerEvent::TransportError { connection, .. }
            | ContainerEvent::ReconnectScheduled { connection, .. }
            | ContainerEvent::ReconnectExhausted { connection, .. }
            | ContainerEvent::ConnectionAccepted { connection, .. }
            | ContainerEvent::SessionOpened { connection, .. }
            | ContainerEvent::SessionClosed { connection, .. }
            | ContainerEvent::LinkOpened { connection, .. }
            | ContainerEvent::LinkClosed { connection, .. }
            | ContainerEvent::DeliverySettled { connection, .. }
            | ContainerEvent::TransactionDeclared { connection, .. }
            | ContainerEvent::TransactionDeclareFailed { connection }
            | ContainerEvent::TransactionCommitted { connection }
            | ContainerEvent::TransactionCommitFailed { connection }
            | ContainerEvent::TransactionAborted { connection } => Some(*connection),
            ContainerEvent::ContainerClosed => None,
        }
    }

    /// 获取事件相关的链路
    pub fn link(&self) -> Option<LinkHandle> {
        match self {
            ContainerEvent::LinkOpened { link, .. }
            | ContainerEvent::LinkClosed { link, .. }
            | ContainerEvent::DeliverySettled { link, .. } => Some(*link),
            _ => None,
        }
    }

    /// 判断是否为连接相关事件
    pub fn is_connection_event(&self) -> bool {
        matches!(
            self,
            ContainerEvent::ConnectionAttempt { .. }
                | ContainerEvent::ConnectionOpened { .. }
                | ContainerEvent::ConnectionClosed { .. }
                | ContainerEvent::ReconnectScheduled { .. }
                | ContainerEvent::ReconnectExhausted { .. }
                | ContainerEvent::ConnectionAccepted { .. }
        )
    }

    /// 判断是否为错误事件
    pub fn is_error_event(&self) -> bool {
        matches!(
            self,
            ContainerEvent::TransportError { .. }
                | ContainerEvent::ReconnectExhausted { .. }
                | ContainerEvent::TransactionDeclareFailed { .. }
                | ContainerEvent::TransactionCommitFailed { .. }
        )
    }

    pub fn is_transaction_event(&self) -> bool {
        matches!(
            self,
            ContainerEvent::TransactionDeclared { .. }
                | ContainerEvent::TransactionDeclareFailed { .. }
                | ContainerEvent::TransactionCommitted { .. }
                | ContainerEvent::TransactionCommitFailed { .. }
                | ContainerEvent::TransactionAborted { .. }
        )
    }
}

/// 处理器返回值：是否继续交给链上的下一个处理器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFlow {
    Continue,
    Handled,
}

/// 事件处理器
///
/// 分发顺序：链路处理器、连接处理器、全局处理器。
/// 返回 `EventFlow::Handled` 时后续处理器不再收到该事件。
pub trait Handler: Send + Sync {
    fn on_event(&self, event: &ContainerEvent) -> EventFlow;
}

impl<F> Handler for F
where
    F: Fn(&ContainerEvent) -> EventFlow + Send + Sync,
{
    fn on_event(&self, event: &ContainerEvent) -> EventFlow {
        self(event)
    }
}

pub type HandlerRef = Arc<dyn Handler>;

/// 沿处理器链分发事件，返回是否有处理器接管
pub fn dispatch<'a, I>(chain: I, event: &ContainerEvent) -> bool
where
    I: IntoIterator<Item = &'a HandlerRef>,
{
    for handler in chain {
        if handler.on_event(event) == EventFlow::Handled {
            return true;
        }
    }
    false
}
