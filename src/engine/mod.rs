//! 协议引擎能力
//!
//! 容器层不产生任何线路字节：帧编解码、协议状态机都由实现 `ProtocolEngine`
//! 的外部引擎负责。容器只通过不透明句柄操作实体。

pub mod memory;
pub mod state;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::EngineError;

pub use memory::MemoryEngine;
pub use state::EndpointState;

/// 容器内共享的引擎引用，持锁期间不得再获取其它注册表锁
pub type SharedEngine = Arc<Mutex<dyn ProtocolEngine>>;

macro_rules! engine_handle {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "-{}"), self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

engine_handle!(
    /// 引擎连接句柄
    ConnectionHandle, "connection"
);
engine_handle!(
    /// 引擎会话句柄
    SessionHandle, "session"
);
engine_handle!(
    /// 引擎链路句柄（发送端或接收端）
    LinkHandle, "link"
);
engine_handle!(
    /// 引擎投递句柄
    DeliveryHandle, "delivery"
);

/// 错误条件，关闭端点时告知对端失败原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub name: String,
    pub description: Option<String>,
}

impl Condition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {}", self.name, description),
            None => f.write_str(&self.name),
        }
    }
}

/// 链路方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRole {
    Sender,
    Receiver,
}

/// 链路的两端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Terminus {
    Source,
    Target,
}

/// 终端节点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TerminusKind {
    #[default]
    Node,
    /// 事务协调者
    Coordinator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenderSettleMode {
    Unsettled,
    Settled,
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiverSettleMode {
    First,
    Second,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistributionMode {
    Move,
    Copy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Durability {
    None,
    Configuration,
    UnsettledState,
}

/// 在 open 之前应用到链路上的附加设置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSetting {
    SenderSettle(SenderSettleMode),
    ReceiverSettle(ReceiverSettleMode),
    Distribution(DistributionMode),
    /// 持久订阅：源端持久化并且永不过期
    Durable(Durability),
    /// 源端过滤器，例如 JMS selector
    Filter { name: String, descriptor: String, value: String },
    /// 目标端能力声明
    TargetCapability(String),
    /// 动态节点属性
    DynamicNodeProperty { key: String, value: String },
}

impl LinkSetting {
    /// 至多一次：发送即结算
    pub fn at_most_once() -> Self {
        LinkSetting::SenderSettle(SenderSettleMode::Settled)
    }

    /// 至少一次：发送端不结算，接收端先结算
    pub fn at_least_once() -> [Self; 2] {
        [
            LinkSetting::SenderSettle(SenderSettleMode::Unsettled),
            LinkSetting::ReceiverSettle(ReceiverSettleMode::First),
        ]
    }

    pub fn selector(value: impl Into<String>) -> Self {
        LinkSetting::Filter {
            name: "selector".to_string(),
            descriptor: "apache.org:selector-filter:string".to_string(),
            value: value.into(),
        }
    }

    /// 只对接收端有意义的设置
    pub fn receiver_only(&self) -> bool {
        matches!(
            self,
            LinkSetting::Distribution(_) | LinkSetting::Durable(_) | LinkSetting::Filter { .. }
        )
    }

    /// 该设置是否适用于给定方向的链路
    pub fn applies_to(&self, role: LinkRole) -> bool {
        !self.receiver_only() || role == LinkRole::Receiver
    }
}

/// 投递结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Rejected,
    Released,
    Modified,
}

/// 本地投递状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    Outcome(Outcome),
    /// 事务性状态：事务ID加可选结果
    Transactional { txn_id: Bytes, outcome: Option<Outcome> },
}

/// 对端给出的投递状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    Accepted,
    Rejected,
    Released,
    Modified,
    /// 事务声明成功，附带事务ID
    Declared { txn_id: Bytes },
    Unknown,
}

/// 发往协调者的事务控制请求，由引擎负责编码
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionControl {
    Declare,
    Discharge { txn_id: Option<Bytes>, fail: bool },
}

/// 协议引擎能力接口
///
/// 所有方法都在事件循环线程上调用。失败时返回 `EngineError`，容器层不做任何重试。
pub trait ProtocolEngine: Send {
    // ---- connection ----

    fn connection_new(&mut self) -> Result<ConnectionHandle, EngineError>;

    fn connection_set_container(&mut self, connection: ConnectionHandle, container_id: &str) -> Result<(), EngineError>;

    fn connection_set_hostname(&mut self, connection: ConnectionHandle, hostname: &str) -> Result<(), EngineError>;

    fn connection_open(&mut self, connection: ConnectionHandle) -> Result<(), EngineError>;

    fn connection_close(&mut self, connection: ConnectionHandle) -> Result<(), EngineError>;

    fn connection_set_condition(&mut self, connection: ConnectionHandle, condition: &Condition) -> Result<(), EngineError>;

    fn connection_state(&self, connection: ConnectionHandle) -> Result<EndpointState, EngineError>;

    /// 释放连接及其所有子实体
    fn connection_release(&mut self, connection: ConnectionHandle);

    // ---- session ----

    fn session_new(&mut self, connection: ConnectionHandle) -> Result<SessionHandle, EngineError>;

    fn session_open(&mut self, session: SessionHandle) -> Result<(), EngineError>;

    fn session_close(&mut self, session: SessionHandle) -> Result<(), EngineError>;

    fn session_set_condition(&mut self, session: SessionHandle, condition: &Condition) -> Result<(), EngineError>;

    fn session_state(&self, session: SessionHandle) -> Result<EndpointState, EngineError>;

    fn session_connection(&self, session: SessionHandle) -> Result<ConnectionHandle, EngineError>;

    /// 连接上第一个匹配掩码的会话
    fn session_head(&self, connection: ConnectionHandle, mask: EndpointState) -> Option<SessionHandle>;

    /// 同一连接上 `session` 之后第一个匹配掩码的会话
    fn session_next(&self, session: SessionHandle, mask: EndpointState) -> Option<SessionHandle>;

    fn session_incoming_bytes(&self, session: SessionHandle) -> Result<usize, EngineError>;

    fn session_outgoing_bytes(&self, session: SessionHandle) -> Result<usize, EngineError>;

    fn session_incoming_capacity(&self, session: SessionHandle) -> Result<usize, EngineError>;

    fn session_set_incoming_capacity(&mut self, session: SessionHandle, capacity: usize) -> Result<(), EngineError>;

    // ---- link ----

    fn link_new(&mut self, session: SessionHandle, role: LinkRole, name: &str) -> Result<LinkHandle, EngineError>;

    fn link_open(&mut self, link: LinkHandle) -> Result<(), EngineError>;

    fn link_close(&mut self, link: LinkHandle) -> Result<(), EngineError>;

    fn link_set_condition(&mut self, link: LinkHandle, condition: &Condition) -> Result<(), EngineError>;

    fn link_state(&self, link: LinkHandle) -> Result<EndpointState, EngineError>;

    fn link_session(&self, link: LinkHandle) -> Result<SessionHandle, EngineError>;

    fn link_name(&self, link: LinkHandle) -> Result<String, EngineError>;

    fn link_role(&self, link: LinkHandle) -> Result<LinkRole, EngineError>;

    fn link_apply(&mut self, link: LinkHandle, setting: &LinkSetting) -> Result<(), EngineError>;

    fn terminus_address(&self, link: LinkHandle, terminus: Terminus) -> Result<Option<String>, EngineError>;

    fn terminus_set_address(&mut self, link: LinkHandle, terminus: Terminus, address: &str) -> Result<(), EngineError>;

    fn terminus_set_dynamic(&mut self, link: LinkHandle, terminus: Terminus, dynamic: bool) -> Result<(), EngineError>;

    fn terminus_is_dynamic(&self, link: LinkHandle, terminus: Terminus) -> Result<bool, EngineError>;

    fn terminus_set_kind(&mut self, link: LinkHandle, terminus: Terminus, kind: TerminusKind) -> Result<(), EngineError>;

    // ---- delivery ----

    /// 发送一条已编码的原始消息
    fn send(&mut self, link: LinkHandle, payload: Bytes) -> Result<DeliveryHandle, EngineError>;

    /// 在协调者链路上发送事务控制请求
    fn send_control(&mut self, link: LinkHandle, control: &TransactionControl) -> Result<DeliveryHandle, EngineError>;

    fn delivery_update(&mut self, delivery: DeliveryHandle, state: &DeliveryState) -> Result<(), EngineError>;

    fn delivery_settle(&mut self, delivery: DeliveryHandle) -> Result<(), EngineError>;
}
