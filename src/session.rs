//! 会话：连接内的多路复用上下文，链路的父对象
//!
//! 会话只持有父连接的弱引用；连接销毁后的会话操作返回 `ContainerError::Detached`。

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::{
    connection::{Connection, ConnectionInner},
    engine::{Condition, ConnectionHandle, EndpointState, LinkRole, SessionHandle, SharedEngine, Terminus},
    error::ContainerError,
    link::{Link, LinkOptions, Receiver, Sender},
};

pub(crate) struct SessionInner {
    handle: SessionHandle,
    id: String,
    connection_handle: ConnectionHandle,
    engine: SharedEngine,
    connection: Weak<ConnectionInner>,
    condition: Mutex<Option<Condition>>,
    txn_ctl: Mutex<Option<Sender>>,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(handle: SessionHandle, id: String, connection: &Connection) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                handle,
                id,
                connection_handle: connection.handle(),
                engine: connection.engine().clone(),
                connection: connection.downgrade(),
                condition: Mutex::new(None),
                txn_ctl: Mutex::new(None),
            }),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.inner.handle
    }

    /// 连接内唯一的会话标识，形如 `<连接ID>/<十六进制序号>`
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn connection_handle(&self) -> ConnectionHandle {
        self.inner.connection_handle
    }

    /// 是否为同一个逻辑会话
    pub fn ptr_eq(a: &Session, b: &Session) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// 父连接
    pub fn connection(&self) -> Result<Connection, ContainerError> {
        self.inner
            .connection
            .upgrade()
            .map(Connection::from_inner)
            .ok_or_else(|| ContainerError::detached(format!("session {}", self.inner.id)))
    }

    pub fn open(&self) -> Result<(), ContainerError> {
        self.inner.engine.lock().session_open(self.inner.handle)?;
        Ok(())
    }

    /// 关闭会话
    ///
    /// 先把本地设置的错误条件交给引擎，对端才能看到失败原因。
    /// 没有 open 过的会话等价于 open 之后立即 close。
    pub fn close(&self) -> Result<(), ContainerError> {
        let condition = self.inner.condition.lock().clone();
        let mut engine = self.inner.engine.lock();
        if let Some(condition) = condition {
            engine.session_set_condition(self.inner.handle, &condition)?;
        }
        engine.session_close(self.inner.handle)?;
        Ok(())
    }

    pub fn set_condition(&self, condition: Condition) {
        *self.inner.condition.lock() = Some(condition);
    }

    pub fn condition(&self) -> Option<Condition> {
        self.inner.condition.lock().clone()
    }

    pub fn state(&self) -> Result<EndpointState, ContainerError> {
        Ok(self.inner.engine.lock().session_state(self.inner.handle)?)
    }

    /// 同一连接上下一个匹配状态掩码的会话
    pub fn next(&self, mask: EndpointState) -> Result<Option<Session>, ContainerError> {
        let next = self.inner.engine.lock().session_next(self.inner.handle, mask);
        match next {
            Some(handle) => Ok(Some(self.connection()?.wrap_session(handle))),
            None => Ok(None),
        }
    }

    pub fn incoming_bytes(&self) -> Result<usize, ContainerError> {
        Ok(self.inner.engine.lock().session_incoming_bytes(self.inner.handle)?)
    }

    pub fn outgoing_bytes(&self) -> Result<usize, ContainerError> {
        Ok(self.inner.engine.lock().session_outgoing_bytes(self.inner.handle)?)
    }

    pub fn incoming_capacity(&self) -> Result<usize, ContainerError> {
        Ok(self.inner.engine.lock().session_incoming_capacity(self.inner.handle)?)
    }

    pub fn set_incoming_capacity(&self, capacity: usize) -> Result<(), ContainerError> {
        self.inner
            .engine
            .lock()
            .session_set_incoming_capacity(self.inner.handle, capacity)?;
        Ok(())
    }

    /// 创建发送端
    ///
    /// 两个容器之间的链路名称必须唯一，这里不做检查；重名由引擎报错。
    pub fn sender(&self, name: &str) -> Result<Sender, ContainerError> {
        Ok(Sender::new(self.create_link(LinkRole::Sender, name)?))
    }

    /// 创建接收端，名称规则同 `sender`
    pub fn receiver(&self, name: &str) -> Result<Receiver, ContainerError> {
        Ok(Receiver::new(self.create_link(LinkRole::Receiver, name)?))
    }

    fn create_link(&self, role: LinkRole, name: &str) -> Result<Link, ContainerError> {
        let connection = self.connection()?;
        let handle = self.inner.engine.lock().link_new(self.inner.handle, role, name)?;
        let link = Link::new(handle, role, name.to_string(), self.inner.handle, &connection);
        connection.register_link(link.clone());
        tracing::debug!("创建链路 {} ({:?}) name={}", handle, role, name);
        Ok(link)
    }

    /// 创建、配置并打开发送端
    ///
    /// 地址、动态标志和链路设置都在 open 之前写入。
    pub fn open_sender(&self, options: LinkOptions) -> Result<Sender, ContainerError> {
        let link = self.open_link(LinkRole::Sender, options)?;
        Ok(Sender::new(link))
    }

    /// 创建、配置并打开接收端
    pub fn open_receiver(&self, options: LinkOptions) -> Result<Receiver, ContainerError> {
        let link = self.open_link(LinkRole::Receiver, options)?;
        Ok(Receiver::new(link))
    }

    /// 事务控制发送端，同一会话上只创建一次
    pub(crate) fn txn_ctl_or_try_init<F>(&self, init: F) -> Result<Sender, ContainerError>
    where
        F: FnOnce(&Session) -> Result<Sender, ContainerError>,
    {
        let mut slot = self.inner.txn_ctl.lock();
        if let Some(sender) = slot.as_ref() {
            return Ok(sender.clone());
        }
        let sender = init(self)?;
        *slot = Some(sender.clone());
        Ok(sender)
    }

    pub fn txn_ctl(&self) -> Option<Sender> {
        self.inner.txn_ctl.lock().clone()
    }

    fn open_link(&self, role: LinkRole, options: LinkOptions) -> Result<Link, ContainerError> {
        let name = match options.name {
            Some(name) => name,
            None => self.connection()?.next_link_name(),
        };
        let link = self.create_link(role, &name)?;

        if let Some(target) = options.target.as_deref() {
            link.set_address_if_unset(Terminus::Target, target)?;
        }
        if let Some(source) = options.source.as_deref() {
            link.set_address_if_unset(Terminus::Source, source)?;
        }
        if options.dynamic {
            let terminus = match role {
                LinkRole::Sender => Terminus::Target,
                LinkRole::Receiver => Terminus::Source,
            };
            link.set_dynamic(terminus, true)?;
        }
        for setting in options.settings.iter().filter(|s| s.applies_to(role)) {
            link.apply(setting)?;
        }
        if let Some(handler) = options.handler {
            link.set_handler(handler);
        }

        link.open()?;
        Ok(link)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.inner.handle)
            .field("id", &self.inner.id)
            .finish()
    }
}
