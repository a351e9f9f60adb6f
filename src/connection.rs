//! AMQP 连接
//!
//! `Connection` 包装一个引擎连接句柄，并拥有该连接上的附着缓存：
//! 同一个会话/链路句柄无论包装多少次都得到同一个对象。缓存随连接一起销毁，
//! `teardown` 时清空。

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::{
    engine::{Condition, ConnectionHandle, EndpointState, LinkHandle, SessionHandle, SharedEngine},
    error::ContainerError,
    event::HandlerRef,
    link::Link,
    registry::Registry,
    session::Session,
    util::{ContainerId, IdFactory},
};

pub(crate) struct ConnectionInner {
    handle: ConnectionHandle,
    engine: SharedEngine,
    container_id: Arc<ContainerId>,
    /// 以连接ID为前缀，给该连接上的会话编号
    ids: Mutex<IdFactory>,
    condition: Mutex<Option<Condition>>,
    sessions: Registry<SessionHandle, Session>,
    links: Registry<LinkHandle, Link>,
    default_session: Mutex<Option<Session>>,
    handler: Mutex<Option<HandlerRef>>,
    /// 释放时的最后状态；释放后引擎里已经没有这个连接
    released: Mutex<Option<EndpointState>>,
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(
        handle: ConnectionHandle,
        engine: SharedEngine,
        container_id: Arc<ContainerId>,
        ids: IdFactory,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                handle,
                engine,
                container_id,
                ids: Mutex::new(ids),
                condition: Mutex::new(None),
                sessions: Registry::new(),
                links: Registry::new(),
                default_session: Mutex::new(None),
                handler: Mutex::new(None),
                released: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectionInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn engine(&self) -> &SharedEngine {
        &self.inner.engine
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.inner.handle
    }

    /// 容器范围内唯一的连接ID
    pub fn id(&self) -> String {
        self.inner.ids.lock().prefix().to_string()
    }

    pub fn container_id(&self) -> &str {
        self.inner.container_id.as_str()
    }

    pub fn ptr_eq(a: &Connection, b: &Connection) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// 默认链路名称，由容器ID保证唯一
    pub fn next_link_name(&self) -> String {
        self.inner.container_id.next_id()
    }

    pub fn open(&self) -> Result<(), ContainerError> {
        self.inner.engine.lock().connection_open(self.inner.handle)?;
        Ok(())
    }

    /// 关闭连接，先把本地错误条件交给引擎
    pub fn close(&self) -> Result<(), ContainerError> {
        let condition = self.inner.condition.lock().clone();
        let mut engine = self.inner.engine.lock();
        if let Some(condition) = condition {
            engine.connection_set_condition(self.inner.handle, &condition)?;
        }
        engine.connection_close(self.inner.handle)?;
        Ok(())
    }

    pub fn set_condition(&self, condition: Condition) {
        *self.inner.condition.lock() = Some(condition);
    }

    pub fn condition(&self) -> Option<Condition> {
        self.inner.condition.lock().clone()
    }

    /// 已释放的连接返回释放时记录的状态
    pub fn state(&self) -> Result<EndpointState, ContainerError> {
        if let Some(state) = *self.inner.released.lock() {
            return Ok(state);
        }
        Ok(self.inner.engine.lock().connection_state(self.inner.handle)?)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.lock().is_some()
    }

    pub fn handler(&self) -> Option<HandlerRef> {
        self.inner.handler.lock().clone()
    }

    pub fn set_handler(&self, handler: HandlerRef) {
        *self.inner.handler.lock() = Some(handler);
    }

    /// 新建一个会话（未打开）
    pub fn session(&self) -> Result<Session, ContainerError> {
        let handle = self.inner.engine.lock().session_new(self.inner.handle)?;
        Ok(self.wrap_session(handle))
    }

    /// 每个连接一个的默认会话，第一次使用时创建并打开
    pub fn default_session(&self) -> Result<Session, ContainerError> {
        let mut slot = self.inner.default_session.lock();
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }
        let session = self.session()?;
        session.open()?;
        *slot = Some(session.clone());
        Ok(session)
    }

    /// 第一个匹配状态掩码的会话
    pub fn session_head(&self, mask: EndpointState) -> Option<Session> {
        let head = self.inner.engine.lock().session_head(self.inner.handle, mask);
        head.map(|handle| self.wrap_session(handle))
    }

    /// 包装会话句柄；同一句柄总是返回同一个对象
    pub fn wrap_session(&self, handle: SessionHandle) -> Session {
        self.inner.sessions.get_or_insert_with(handle, || {
            let id = self.inner.ids.lock().next();
            Session::new(handle, id, self)
        })
    }

    /// 包装链路句柄；对端发起的链路第一次包装时向引擎查询名称和方向
    pub fn wrap_link(&self, handle: LinkHandle) -> Result<Link, ContainerError> {
        self.inner.links.get_or_try_insert_with(handle, || {
            let engine = self.inner.engine.lock();
            let name = engine.link_name(handle)?;
            let role = engine.link_role(handle)?;
            let session = engine.link_session(handle)?;
            Ok(Link::new(handle, role, name, session, self))
        })
    }

    pub(crate) fn register_link(&self, link: Link) {
        self.inner.links.insert(link.handle(), link);
    }

    pub fn find_link(&self, handle: LinkHandle) -> Option<Link> {
        self.inner.links.get(&handle)
    }

    /// 缓存中的全部会话，按句柄排序
    pub fn sessions(&self) -> Vec<Session> {
        self.inner
            .sessions
            .handles()
            .into_iter()
            .filter_map(|h| self.inner.sessions.get(&h))
            .collect()
    }

    /// 缓存中的全部链路，按句柄排序
    pub fn links(&self) -> Vec<Link> {
        self.inner
            .links
            .handles()
            .into_iter()
            .filter_map(|h| self.inner.links.get(&h))
            .collect()
    }

    /// 清空附着缓存；之后再包装同一句柄会得到新对象
    pub fn teardown(&self) {
        let sessions = self.inner.sessions.clear();
        let links = self.inner.links.clear();
        self.inner.default_session.lock().take();
        tracing::debug!(
            "连接 {} 清理缓存: {} 个会话, {} 个链路",
            self.inner.handle,
            sessions.len(),
            links.len()
        );
    }

    /// 清空缓存并让引擎释放连接及其全部会话、链路
    ///
    /// 之后 `state` 固定返回释放前的状态，其余引擎操作报告无效句柄。
    pub(crate) fn release(&self) {
        self.teardown();
        let mut engine = self.inner.engine.lock();
        let last = engine
            .connection_state(self.inner.handle)
            .unwrap_or(EndpointState::LOCAL_CLOSED | EndpointState::REMOTE_CLOSED);
        *self.inner.released.lock() = Some(last);
        engine.connection_release(self.inner.handle);
    }

    /// 关闭所有缓存中的链路和会话，然后关闭连接本身
    pub(crate) fn close_all(&self) -> Result<(), ContainerError> {
        for link in self.links() {
            if !link.state()?.contains(EndpointState::LOCAL_CLOSED) {
                link.close()?;
            }
        }
        for session in self.sessions() {
            if !session.state()?.contains(EndpointState::LOCAL_CLOSED) {
                session.close()?;
            }
        }
        if !self.state()?.contains(EndpointState::LOCAL_CLOSED) {
            self.close()?;
        }
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.inner.handle)
            .field("container_id", &self.inner.container_id.as_str())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{LinkRole, MemoryEngine, ProtocolEngine};
    use crate::link::LinkOptions;

    fn connection() -> (Arc<Mutex<MemoryEngine>>, Connection) {
        let engine = Arc::new(Mutex::new(MemoryEngine::new()));
        let handle = engine.lock().connection_new().unwrap();
        let shared: SharedEngine = engine.clone();
        let container_id = Arc::new(ContainerId::new(Some("test")));
        let connection = Connection::new(handle, shared, container_id, IdFactory::new("test/1"));
        (engine, connection)
    }

    #[test]
    fn test_wrap_session_preserves_identity() {
        let (_engine, connection) = connection();
        let session = connection.session().unwrap();

        let again = connection.wrap_session(session.handle());
        assert!(Session::ptr_eq(&session, &again));
        assert_eq!(session.id(), "test/1/1");
    }

    #[test]
    fn test_default_session_is_open_and_reused() {
        let (_engine, connection) = connection();
        let first = connection.default_session().unwrap();
        let second = connection.default_session().unwrap();

        assert!(Session::ptr_eq(&first, &second));
        assert!(first.state().unwrap().contains(EndpointState::LOCAL_ACTIVE));
    }

    #[test]
    fn test_wrap_remote_link() {
        let (engine, connection) = connection();
        let session = connection.session().unwrap();
        let handle = engine
            .lock()
            .link_new(session.handle(), LinkRole::Receiver, "peer-link")
            .unwrap();

        let link = connection.wrap_link(handle).unwrap();
        assert_eq!(link.name(), "peer-link");
        assert!(link.is_receiver());
        assert!(Link::ptr_eq(&link, &connection.wrap_link(handle).unwrap()));
    }

    #[test]
    fn test_teardown_clears_caches() {
        let (_engine, connection) = connection();
        let session = connection.default_session().unwrap();
        let sender = session.open_sender(LinkOptions::new().with_target("q")).unwrap();

        connection.teardown();
        assert!(connection.links().is_empty());
        let rewrapped = connection.wrap_session(session.handle());
        assert!(!Session::ptr_eq(&session, &rewrapped));
        assert!(connection.find_link(sender.handle()).is_none());
    }

    #[test]
    fn test_release_keeps_last_state() {
        let (engine, connection) = connection();
        connection.open().unwrap();
        let session = connection.default_session().unwrap();
        session.open_sender(LinkOptions::new().with_target("q")).unwrap();
        connection.close_all().unwrap();

        connection.release();
        assert!(connection.is_released());
        assert!(connection.state().unwrap().contains(EndpointState::LOCAL_CLOSED));
        assert!(connection.links().is_empty());
        assert_eq!(engine.lock().connection_count(), 0);
        assert_eq!(engine.lock().link_count(), 0);
        assert!(session.state().is_err());
    }

    #[test]
    fn test_session_detached_after_drop() {
        let (_engine, connection) = connection();
        let session = connection.session().unwrap();
        drop(connection);

        let err = session.connection().unwrap_err();
        assert!(matches!(err, ContainerError::Detached { .. }));
    }
}
