//! In-process protocol engine
//!
//! Keeps every entity in plain maps, records local open/close transitions and
//! lets callers drive the remote half by hand. Nothing is put on a wire.

use std::collections::HashMap;

use bytes::Bytes;

use super::{
    Condition, ConnectionHandle, DeliveryHandle, DeliveryState, EndpointState, LinkHandle,
    LinkRole, LinkSetting, ProtocolEngine, SessionHandle, Terminus, TerminusKind,
    TransactionControl,
};
use crate::error::{EngineError, EngineErrorKind};

/// Default incoming capacity for new sessions
pub const DEFAULT_INCOMING_CAPACITY: usize = 1024 * 1024;

/// Local transition recorded by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTransition {
    Open,
    Close,
}

/// Any endpoint the engine tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRef {
    Connection(ConnectionHandle),
    Session(SessionHandle),
    Link(LinkHandle),
}

impl From<ConnectionHandle> for EndpointRef {
    fn from(handle: ConnectionHandle) -> Self {
        EndpointRef::Connection(handle)
    }
}

impl From<SessionHandle> for EndpointRef {
    fn from(handle: SessionHandle) -> Self {
        EndpointRef::Session(handle)
    }
}

impl From<LinkHandle> for EndpointRef {
    fn from(handle: LinkHandle) -> Self {
        EndpointRef::Link(handle)
    }
}

#[derive(Debug, Clone)]
struct Endpoint {
    state: EndpointState,
    condition: Option<Condition>,
    history: Vec<LocalTransition>,
}

impl Endpoint {
    fn new() -> Self {
        Self {
            state: EndpointState::initial(),
            condition: None,
            history: Vec::new(),
        }
    }

    fn open(&mut self) {
        if self.state.contains(EndpointState::LOCAL_UNINIT) {
            self.state = self.state.with_local(EndpointState::LOCAL_ACTIVE);
            self.history.push(LocalTransition::Open);
        }
    }

    /// Closing an endpoint that was never opened opens it first
    fn close(&mut self) {
        if self.state.contains(EndpointState::LOCAL_CLOSED) {
            return;
        }
        self.open();
        self.state = self.state.with_local(EndpointState::LOCAL_CLOSED);
        self.history.push(LocalTransition::Close);
    }
}

#[derive(Debug, Clone, Default)]
struct TerminusEntry {
    address: Option<String>,
    dynamic: bool,
    kind: TerminusKind,
}

#[derive(Debug)]
struct ConnectionEntry {
    endpoint: Endpoint,
    container: Option<String>,
    hostname: Option<String>,
    sessions: Vec<SessionHandle>,
}

#[derive(Debug)]
struct SessionEntry {
    endpoint: Endpoint,
    connection: ConnectionHandle,
    incoming_bytes: usize,
    outgoing_bytes: usize,
    incoming_capacity: usize,
    links: Vec<LinkHandle>,
}

#[derive(Debug)]
struct LinkEntry {
    endpoint: Endpoint,
    session: SessionHandle,
    role: LinkRole,
    name: String,
    source: TerminusEntry,
    target: TerminusEntry,
    settings: Vec<LinkSetting>,
}

impl LinkEntry {
    fn terminus(&self, terminus: Terminus) -> &TerminusEntry {
        match terminus {
            Terminus::Source => &self.source,
            Terminus::Target => &self.target,
        }
    }

    fn terminus_mut(&mut self, terminus: Terminus) -> &mut TerminusEntry {
        match terminus {
            Terminus::Source => &mut self.source,
            Terminus::Target => &mut self.target,
        }
    }
}

/// Payload carried by a recorded delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentPayload {
    Message(Bytes),
    Control(TransactionControl),
}

#[derive(Debug)]
struct DeliveryEntry {
    link: LinkHandle,
    payload: SentPayload,
    local_state: Option<DeliveryState>,
    settled: bool,
}

/// In-memory `ProtocolEngine`
#[derive(Debug, Default)]
pub struct MemoryEngine {
    next_handle: u64,
    connections: HashMap<ConnectionHandle, ConnectionEntry>,
    sessions: HashMap<SessionHandle, SessionEntry>,
    links: HashMap<LinkHandle, LinkEntry>,
    deliveries: HashMap<DeliveryHandle, DeliveryEntry>,
    link_limit: Option<usize>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse link allocation once `limit` links exist
    pub fn with_link_limit(mut self, limit: usize) -> Self {
        self.link_limit = Some(limit);
        self
    }

    fn allocate(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn connection(&self, handle: ConnectionHandle) -> Result<&ConnectionEntry, EngineError> {
        self.connections.get(&handle).ok_or_else(|| EngineError::invalid_handle(handle))
    }

    fn connection_mut(&mut self, handle: ConnectionHandle) -> Result<&mut ConnectionEntry, EngineError> {
        self.connections.get_mut(&handle).ok_or_else(|| EngineError::invalid_handle(handle))
    }

    fn session(&self, handle: SessionHandle) -> Result<&SessionEntry, EngineError> {
        self.sessions.get(&handle).ok_or_else(|| EngineError::invalid_handle(handle))
    }

    fn session_mut(&mut self, handle: SessionHandle) -> Result<&mut SessionEntry, EngineError> {
        self.sessions.get_mut(&handle).ok_or_else(|| EngineError::invalid_handle(handle))
    }

    fn link(&self, handle: LinkHandle) -> Result<&LinkEntry, EngineError> {
        self.links.get(&handle).ok_or_else(|| EngineError::invalid_handle(handle))
    }

    fn link_mut(&mut self, handle: LinkHandle) -> Result<&mut LinkEntry, EngineError> {
        self.links.get_mut(&handle).ok_or_else(|| EngineError::invalid_handle(handle))
    }

    fn delivery_mut(&mut self, handle: DeliveryHandle) -> Result<&mut DeliveryEntry, EngineError> {
        self.deliveries.get_mut(&handle).ok_or_else(|| EngineError::invalid_handle(handle))
    }

    fn endpoint(&self, target: EndpointRef) -> Option<&Endpoint> {
        match target {
            EndpointRef::Connection(h) => self.connections.get(&h).map(|e| &e.endpoint),
            EndpointRef::Session(h) => self.sessions.get(&h).map(|e| &e.endpoint),
            EndpointRef::Link(h) => self.links.get(&h).map(|e| &e.endpoint),
        }
    }

    fn endpoint_mut(&mut self, target: EndpointRef) -> Option<&mut Endpoint> {
        match target {
            EndpointRef::Connection(h) => self.connections.get_mut(&h).map(|e| &mut e.endpoint),
            EndpointRef::Session(h) => self.sessions.get_mut(&h).map(|e| &mut e.endpoint),
            EndpointRef::Link(h) => self.links.get_mut(&h).map(|e| &mut e.endpoint),
        }
    }

    fn session_owner(&self, session: SessionHandle) -> Result<ConnectionHandle, EngineError> {
        Ok(self.session(session)?.connection)
    }

    /// Simulate the peer moving its half of an endpoint
    pub fn set_remote_state(&mut self, target: impl Into<EndpointRef>, remote: EndpointState) -> Result<(), EngineError> {
        let target = target.into();
        let endpoint = self
            .endpoint_mut(target)
            .ok_or_else(|| EngineError::invalid_handle(format!("{:?}", target)))?;
        endpoint.state = endpoint.state.with_remote(remote);
        Ok(())
    }

    /// Simulate buffered bytes on a session
    pub fn set_buffered(&mut self, session: SessionHandle, incoming: usize, outgoing: usize) -> Result<(), EngineError> {
        let entry = self.session_mut(session)?;
        entry.incoming_bytes = incoming;
        entry.outgoing_bytes = outgoing;
        Ok(())
    }

    /// Local transitions in the order they happened
    pub fn history(&self, target: impl Into<EndpointRef>) -> Vec<LocalTransition> {
        self.endpoint(target.into()).map(|e| e.history.clone()).unwrap_or_default()
    }

    /// Condition set locally on an endpoint
    pub fn condition(&self, target: impl Into<EndpointRef>) -> Option<Condition> {
        self.endpoint(target.into()).and_then(|e| e.condition.clone())
    }

    pub fn connection_container(&self, connection: ConnectionHandle) -> Option<String> {
        self.connections.get(&connection).and_then(|c| c.container.clone())
    }

    pub fn connection_hostname(&self, connection: ConnectionHandle) -> Option<String> {
        self.connections.get(&connection).and_then(|c| c.hostname.clone())
    }

    pub fn link_settings(&self, link: LinkHandle) -> Vec<LinkSetting> {
        self.links.get(&link).map(|l| l.settings.clone()).unwrap_or_default()
    }

    pub fn terminus_kind(&self, link: LinkHandle, terminus: Terminus) -> Option<TerminusKind> {
        self.links.get(&link).map(|l| l.terminus(terminus).kind)
    }

    /// Links allocated on a session, in creation order
    pub fn session_links(&self, session: SessionHandle) -> Vec<LinkHandle> {
        self.sessions.get(&session).map(|s| s.links.clone()).unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Everything sent on a link, in order
    pub fn sent(&self, link: LinkHandle) -> Vec<(DeliveryHandle, SentPayload)> {
        let mut sent: Vec<(DeliveryHandle, SentPayload)> = self
            .deliveries
            .iter()
            .filter(|(_, d)| d.link == link)
            .map(|(h, d)| (*h, d.payload.clone()))
            .collect();
        sent.sort_by_key(|(h, _)| *h);
        sent
    }

    pub fn delivery_state(&self, delivery: DeliveryHandle) -> Option<DeliveryState> {
        self.deliveries.get(&delivery).and_then(|d| d.local_state.clone())
    }

    pub fn is_settled(&self, delivery: DeliveryHandle) -> bool {
        self.deliveries.get(&delivery).map(|d| d.settled).unwrap_or(false)
    }

    fn record_delivery(&mut self, link: LinkHandle, payload: SentPayload) -> Result<DeliveryHandle, EngineError> {
        let entry = self.link(link)?;
        if entry.role != LinkRole::Sender {
            return Err(EngineError::new(
                EngineErrorKind::ProtocolViolation,
                format!("{} is not a sender", link),
            ));
        }
        if !entry.endpoint.state.contains(EndpointState::LOCAL_ACTIVE) {
            return Err(EngineError::new(
                EngineErrorKind::ProtocolViolation,
                format!("{} is not open", link),
            ));
        }
        let session = entry.session;
        let size = match &payload {
            SentPayload::Message(bytes) => bytes.len(),
            SentPayload::Control(_) => 0,
        };
        self.session_mut(session)?.outgoing_bytes += size;

        let handle = DeliveryHandle::new(self.allocate());
        self.deliveries.insert(handle, DeliveryEntry {
            link,
            payload,
            local_state: None,
            settled: false,
        });
        Ok(handle)
    }
}

impl ProtocolEngine for MemoryEngine {
    fn connection_new(&mut self) -> Result<ConnectionHandle, EngineError> {
        let handle = ConnectionHandle::new(self.allocate());
        self.connections.insert(handle, ConnectionEntry {
            endpoint: Endpoint::new(),
            container: None,
            hostname: None,
            sessions: Vec::new(),
        });
        Ok(handle)
    }

    fn connection_set_container(&mut self, connection: ConnectionHandle, container_id: &str) -> Result<(), EngineError> {
        self.connection_mut(connection)?.container = Some(container_id.to_string());
        Ok(())
    }

    fn connection_set_hostname(&mut self, connection: ConnectionHandle, hostname: &str) -> Result<(), EngineError> {
        self.connection_mut(connection)?.hostname = Some(hostname.to_string());
        Ok(())
    }

    fn connection_open(&mut self, connection: ConnectionHandle) -> Result<(), EngineError> {
        self.connection_mut(connection)?.endpoint.open();
        Ok(())
    }

    fn connection_close(&mut self, connection: ConnectionHandle) -> Result<(), EngineError> {
        self.connection_mut(connection)?.endpoint.close();
        Ok(())
    }

    fn connection_set_condition(&mut self, connection: ConnectionHandle, condition: &Condition) -> Result<(), EngineError> {
        self.connection_mut(connection)?.endpoint.condition = Some(condition.clone());
        Ok(())
    }

    fn connection_state(&self, connection: ConnectionHandle) -> Result<EndpointState, EngineError> {
        Ok(self.connection(connection)?.endpoint.state)
    }

    fn connection_release(&mut self, connection: ConnectionHandle) {
        let Some(entry) = self.connections.remove(&connection) else {
            return;
        };
        for session in entry.sessions {
            if let Some(session) = self.sessions.remove(&session) {
                for link in session.links {
                    self.links.remove(&link);
                }
            }
        }
        let links = &self.links;
        self.deliveries.retain(|_, d| links.contains_key(&d.link));
    }

    fn session_new(&mut self, connection: ConnectionHandle) -> Result<SessionHandle, EngineError> {
        self.connection(connection)?;
        let handle = SessionHandle::new(self.allocate());
        self.sessions.insert(handle, SessionEntry {
            endpoint: Endpoint::new(),
            connection,
            incoming_bytes: 0,
            outgoing_bytes: 0,
            incoming_capacity: DEFAULT_INCOMING_CAPACITY,
            links: Vec::new(),
        });
        self.connection_mut(connection)?.sessions.push(handle);
        Ok(handle)
    }

    fn session_open(&mut self, session: SessionHandle) -> Result<(), EngineError> {
        self.session_mut(session)?.endpoint.open();
        Ok(())
    }

    fn session_close(&mut self, session: SessionHandle) -> Result<(), EngineError> {
        self.session_mut(session)?.endpoint.close();
        Ok(())
    }

    fn session_set_condition(&mut self, session: SessionHandle, condition: &Condition) -> Result<(), EngineError> {
        self.session_mut(session)?.endpoint.condition = Some(condition.clone());
        Ok(())
    }

    fn session_state(&self, session: SessionHandle) -> Result<EndpointState, EngineError> {
        Ok(self.session(session)?.endpoint.state)
    }

    fn session_connection(&self, session: SessionHandle) -> Result<ConnectionHandle, EngineError> {
        Ok(self.session(session)?.connection)
    }

    fn session_head(&self, connection: ConnectionHandle, mask: EndpointState) -> Option<SessionHandle> {
        let entry = self.connections.get(&connection)?;
        entry.sessions.iter().copied().find(|s| {
            self.sessions
                .get(s)
                .map(|e| e.endpoint.state.matches(mask))
                .unwrap_or(false)
        })
    }

    fn session_next(&self, session: SessionHandle, mask: EndpointState) -> Option<SessionHandle> {
        let connection = self.sessions.get(&session)?.connection;
        let siblings = &self.connections.get(&connection)?.sessions;
        let position = siblings.iter().position(|s| *s == session)?;
        siblings[position + 1..].iter().copied().find(|s| {
            self.sessions
                .get(s)
                .map(|e| e.endpoint.state.matches(mask))
                .unwrap_or(false)
        })
    }

    fn session_incoming_bytes(&self, session: SessionHandle) -> Result<usize, EngineError> {
        Ok(self.session(session)?.incoming_bytes)
    }

    fn session_outgoing_bytes(&self, session: SessionHandle) -> Result<usize, EngineError> {
        Ok(self.session(session)?.outgoing_bytes)
    }

    fn session_incoming_capacity(&self, session: SessionHandle) -> Result<usize, EngineError> {
        Ok(self.session(session)?.incoming_capacity)
    }

    fn session_set_incoming_capacity(&mut self, session: SessionHandle, capacity: usize) -> Result<(), EngineError> {
        self.session_mut(session)?.incoming_capacity = capacity;
        Ok(())
    }

    fn link_new(&mut self, session: SessionHandle, role: LinkRole, name: &str) -> Result<LinkHandle, EngineError> {
        let connection = self.session_owner(session)?;

        if let Some(limit) = self.link_limit {
            if self.links.len() >= limit {
                return Err(EngineError::new(
                    EngineErrorKind::ResourceExhausted,
                    format!("link limit {} reached", limit),
                ));
            }
        }

        // 同一连接、同一方向上的链路名称必须唯一
        let collision = self.links.values().any(|l| {
            l.role == role
                && l.name == name
                && self
                    .sessions
                    .get(&l.session)
                    .map(|s| s.connection == connection)
                    .unwrap_or(false)
        });
        if collision {
            return Err(EngineError::name_collision(name));
        }

        let handle = LinkHandle::new(self.allocate());
        self.links.insert(handle, LinkEntry {
            endpoint: Endpoint::new(),
            session,
            role,
            name: name.to_string(),
            source: TerminusEntry::default(),
            target: TerminusEntry::default(),
            settings: Vec::new(),
        });
        self.session_mut(session)?.links.push(handle);
        Ok(handle)
    }

    fn link_open(&mut self, link: LinkHandle) -> Result<(), EngineError> {
        self.link_mut(link)?.endpoint.open();
        Ok(())
    }

    fn link_close(&mut self, link: LinkHandle) -> Result<(), EngineError> {
        self.link_mut(link)?.endpoint.close();
        Ok(())
    }

    fn link_set_condition(&mut self, link: LinkHandle, condition: &Condition) -> Result<(), EngineError> {
        self.link_mut(link)?.endpoint.condition = Some(condition.clone());
        Ok(())
    }

    fn link_state(&self, link: LinkHandle) -> Result<EndpointState, EngineError> {
        Ok(self.link(link)?.endpoint.state)
    }

    fn link_session(&self, link: LinkHandle) -> Result<SessionHandle, EngineError> {
        Ok(self.link(link)?.session)
    }

    fn link_name(&self, link: LinkHandle) -> Result<String, EngineError> {
        Ok(self.link(link)?.name.clone())
    }

    fn link_role(&self, link: LinkHandle) -> Result<LinkRole, EngineError> {
        Ok(self.link(link)?.role)
    }

    fn link_apply(&mut self, link: LinkHandle, setting: &LinkSetting) -> Result<(), EngineError> {
        self.link_mut(link)?.settings.push(setting.clone());
        Ok(())
    }

    fn terminus_address(&self, link: LinkHandle, terminus: Terminus) -> Result<Option<String>, EngineError> {
        Ok(self.link(link)?.terminus(terminus).address.clone())
    }

    fn terminus_set_address(&mut self, link: LinkHandle, terminus: Terminus, address: &str) -> Result<(), EngineError> {
        self.link_mut(link)?.terminus_mut(terminus).address = Some(address.to_string());
        Ok(())
    }

    fn terminus_set_dynamic(&mut self, link: LinkHandle, terminus: Terminus, dynamic: bool) -> Result<(), EngineError> {
        self.link_mut(link)?.terminus_mut(terminus).dynamic = dynamic;
        Ok(())
    }

    fn terminus_is_dynamic(&self, link: LinkHandle, terminus: Terminus) -> Result<bool, EngineError> {
        Ok(self.link(link)?.terminus(terminus).dynamic)
    }

    fn terminus_set_kind(&mut self, link: LinkHandle, terminus: Terminus, kind: TerminusKind) -> Result<(), EngineError> {
        self.link_mut(link)?.terminus_mut(terminus).kind = kind;
        Ok(())
    }

    fn send(&mut self, link: LinkHandle, payload: Bytes) -> Result<DeliveryHandle, EngineError> {
        self.record_delivery(link, SentPayload::Message(payload))
    }

    fn send_control(&mut self, link: LinkHandle, control: &TransactionControl) -> Result<DeliveryHandle, EngineError> {
        self.record_delivery(link, SentPayload::Control(control.clone()))
    }

    fn delivery_update(&mut self, delivery: DeliveryHandle, state: &DeliveryState) -> Result<(), EngineError> {
        self.delivery_mut(delivery)?.local_state = Some(state.clone());
        Ok(())
    }

    fn delivery_settle(&mut self, delivery: DeliveryHandle) -> Result<(), EngineError> {
        self.delivery_mut(delivery)?.settled = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_session() -> (MemoryEngine, ConnectionHandle, SessionHandle) {
        let mut engine = MemoryEngine::new();
        let conn = engine.connection_new().unwrap();
        let session = engine.session_new(conn).unwrap();
        (engine, conn, session)
    }

    #[test]
    fn test_close_before_open_records_both() {
        let (mut engine, _, session) = engine_with_session();
        engine.session_close(session).unwrap();

        assert_eq!(engine.history(session), vec![LocalTransition::Open, LocalTransition::Close]);
        let state = engine.session_state(session).unwrap();
        assert!(state.contains(EndpointState::LOCAL_CLOSED));
        assert!(state.contains(EndpointState::REMOTE_UNINIT));

        // 重复关闭不再记录
        engine.session_close(session).unwrap();
        assert_eq!(engine.history(session).len(), 2);
    }

    #[test]
    fn test_name_collision_per_direction() {
        let (mut engine, conn, session) = engine_with_session();
        engine.link_new(session, LinkRole::Sender, "orders").unwrap();
        // 反方向同名可以
        engine.link_new(session, LinkRole::Receiver, "orders").unwrap();

        let other = engine.session_new(conn).unwrap();
        let err = engine.link_new(other, LinkRole::Sender, "orders").unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::NameCollision);
    }

    #[test]
    fn test_link_limit() {
        let mut engine = MemoryEngine::new().with_link_limit(1);
        let conn = engine.connection_new().unwrap();
        let session = engine.session_new(conn).unwrap();
        engine.link_new(session, LinkRole::Sender, "a").unwrap();
        let err = engine.link_new(session, LinkRole::Sender, "b").unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::ResourceExhausted);
    }

    #[test]
    fn test_session_traversal_by_mask() {
        let (mut engine, conn, first) = engine_with_session();
        let second = engine.session_new(conn).unwrap();
        let third = engine.session_new(conn).unwrap();
        engine.session_open(first).unwrap();
        engine.session_open(third).unwrap();

        let active = EndpointState::LOCAL_ACTIVE;
        assert_eq!(engine.session_head(conn, active), Some(first));
        assert_eq!(engine.session_next(first, active), Some(third));
        assert_eq!(engine.session_next(third, active), None);
        assert_eq!(engine.session_head(conn, EndpointState::LOCAL_UNINIT), Some(second));
    }

    #[test]
    fn test_send_requires_open_sender() {
        let (mut engine, _, session) = engine_with_session();
        let sender = engine.link_new(session, LinkRole::Sender, "s").unwrap();
        assert!(engine.send(sender, Bytes::from_static(b"x")).is_err());

        engine.link_open(sender).unwrap();
        let delivery = engine.send(sender, Bytes::from_static(b"hello")).unwrap();
        assert_eq!(engine.session_outgoing_bytes(session).unwrap(), 5);
        assert_eq!(engine.sent(sender), vec![(delivery, SentPayload::Message(Bytes::from_static(b"hello")))]);
    }

    #[test]
    fn test_release_drops_children() {
        let (mut engine, conn, session) = engine_with_session();
        engine.link_new(session, LinkRole::Sender, "s").unwrap();
        engine.connection_release(conn);
        assert_eq!(engine.session_count(), 0);
        assert_eq!(engine.link_count(), 0);
        assert!(engine.connection_state(conn).is_err());
    }
}
