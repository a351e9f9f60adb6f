//! amqp-container - AMQP 1.0 容器编排层
//!
//! 管理连接、会话、链路与事务的生命周期，并为它们生成不冲突的标识。
//! 协议编解码与网络 I/O 通过 `ProtocolEngine` 和 `Reactor` 两个能力接入。

// 外部能力
pub mod engine;
pub mod reactor;

// 核心实体
pub mod connection;
pub mod session;
pub mod link;
pub mod transaction;
pub mod container;

// 连接建立
pub mod address;
pub mod connector;
pub mod tls;

// 基础设施
pub mod config;
pub mod error;
pub mod event;
pub mod registry;
pub mod stream;
pub mod util;

// 重新导出核心类型
pub use address::{AmqpUrl, UrlList};
pub use config::{BackoffConfig, ContainerConfig};
pub use connection::Connection;
pub use connector::{Backoff, Connector, ReconnectPolicy, TransportSettings};
pub use container::{Acceptor, ConnectOptions, Container, Context};
pub use engine::{
    Condition, ConnectionHandle, DeliveryHandle, EndpointState, LinkHandle, LinkRole, LinkSetting, MemoryEngine,
    ProtocolEngine, SessionHandle, SharedEngine, Terminus,
};
pub use error::{ContainerError, EngineError, EngineErrorKind};
pub use event::{ContainerEvent, EventFlow, Handler, HandlerRef};
pub use link::{Link, LinkOptions, Receiver, Sender};
pub use reactor::{AcceptorHandle, Reactor, ReactorEvent, TransportTarget};
pub use session::Session;
pub use stream::ContainerEventStream;
pub use tls::{SslConfig, TlsDomain};
pub use transaction::{Transaction, TransactionHandler};
pub use util::{ContainerId, Counter, IdFactory};

// 便捷的类型别名
pub type Result<T> = std::result::Result<T, ContainerError>;
