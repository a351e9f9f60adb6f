//! Senders and receivers
//!
//! A `Link` wraps exactly one engine link handle. Clones share the same
//! wrapper; `Link::ptr_eq` tells whether two values are the same logical link.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    connection::{Connection, ConnectionInner},
    engine::{
        Condition, ConnectionHandle, DeliveryHandle, EndpointState, LinkHandle, LinkRole, LinkSetting, SessionHandle,
        SharedEngine, Terminus, TerminusKind,
    },
    error::ContainerError,
    event::HandlerRef,
    session::Session,
};

pub(crate) struct LinkInner {
    handle: LinkHandle,
    role: LinkRole,
    name: String,
    session: SessionHandle,
    connection_handle: ConnectionHandle,
    engine: SharedEngine,
    connection: Weak<ConnectionInner>,
    condition: Mutex<Option<Condition>>,
    handler: Mutex<Option<HandlerRef>>,
}

#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl Link {
    pub(crate) fn new(
        handle: LinkHandle,
        role: LinkRole,
        name: String,
        session: SessionHandle,
        connection: &Connection,
    ) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                handle,
                role,
                name,
                session,
                connection_handle: connection.handle(),
                engine: connection.engine().clone(),
                connection: connection.downgrade(),
                condition: Mutex::new(None),
                handler: Mutex::new(None),
            }),
        }
    }

    pub fn handle(&self) -> LinkHandle {
        self.inner.handle
    }

    pub fn role(&self) -> LinkRole {
        self.inner.role
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_sender(&self) -> bool {
        self.inner.role == LinkRole::Sender
    }

    pub fn is_receiver(&self) -> bool {
        self.inner.role == LinkRole::Receiver
    }

    pub fn session_handle(&self) -> SessionHandle {
        self.inner.session
    }

    pub fn connection_handle(&self) -> ConnectionHandle {
        self.inner.connection_handle
    }

    pub(crate) fn engine(&self) -> &SharedEngine {
        &self.inner.engine
    }

    /// Same logical link
    pub fn ptr_eq(a: &Link, b: &Link) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn connection(&self) -> Result<Connection, ContainerError> {
        self.inner
            .connection
            .upgrade()
            .map(Connection::from_inner)
            .ok_or_else(|| ContainerError::detached(format!("link '{}'", self.inner.name)))
    }

    pub fn session(&self) -> Result<Session, ContainerError> {
        Ok(self.connection()?.wrap_session(self.inner.session))
    }

    pub fn open(&self) -> Result<(), ContainerError> {
        self.inner.engine.lock().link_open(self.inner.handle)?;
        Ok(())
    }

    /// Close the link, sending any locally set condition first
    ///
    /// Closing a link that was never opened opens and closes it.
    pub fn close(&self) -> Result<(), ContainerError> {
        let condition = self.inner.condition.lock().clone();
        let mut engine = self.inner.engine.lock();
        if let Some(condition) = condition {
            engine.link_set_condition(self.inner.handle, &condition)?;
        }
        engine.link_close(self.inner.handle)?;
        Ok(())
    }

    pub fn set_condition(&self, condition: Condition) {
        *self.inner.condition.lock() = Some(condition);
    }

    pub fn condition(&self) -> Option<Condition> {
        self.inner.condition.lock().clone()
    }

    pub fn state(&self) -> Result<EndpointState, ContainerError> {
        Ok(self.inner.engine.lock().link_state(self.inner.handle)?)
    }

    pub fn source_address(&self) -> Result<Option<String>, ContainerError> {
        self.address(Terminus::Source)
    }

    pub fn target_address(&self) -> Result<Option<String>, ContainerError> {
        self.address(Terminus::Target)
    }

    pub fn address(&self, terminus: Terminus) -> Result<Option<String>, ContainerError> {
        Ok(self.inner.engine.lock().terminus_address(self.inner.handle, terminus)?)
    }

    pub fn set_source_address(&self, address: &str) -> Result<(), ContainerError> {
        self.set_address(Terminus::Source, address)
    }

    pub fn set_target_address(&self, address: &str) -> Result<(), ContainerError> {
        self.set_address(Terminus::Target, address)
    }

    pub fn set_address(&self, terminus: Terminus, address: &str) -> Result<(), ContainerError> {
        self.inner
            .engine
            .lock()
            .terminus_set_address(self.inner.handle, terminus, address)?;
        Ok(())
    }

    /// Set the address only when the terminus has none yet
    pub(crate) fn set_address_if_unset(&self, terminus: Terminus, address: &str) -> Result<(), ContainerError> {
        let mut engine = self.inner.engine.lock();
        if engine.terminus_address(self.inner.handle, terminus)?.is_none() {
            engine.terminus_set_address(self.inner.handle, terminus, address)?;
        }
        Ok(())
    }

    pub fn set_dynamic(&self, terminus: Terminus, dynamic: bool) -> Result<(), ContainerError> {
        self.inner
            .engine
            .lock()
            .terminus_set_dynamic(self.inner.handle, terminus, dynamic)?;
        Ok(())
    }

    pub fn is_dynamic(&self, terminus: Terminus) -> Result<bool, ContainerError> {
        Ok(self.inner.engine.lock().terminus_is_dynamic(self.inner.handle, terminus)?)
    }

    pub fn set_terminus_kind(&self, terminus: Terminus, kind: TerminusKind) -> Result<(), ContainerError> {
        self.inner
            .engine
            .lock()
            .terminus_set_kind(self.inner.handle, terminus, kind)?;
        Ok(())
    }

    pub fn apply(&self, setting: &LinkSetting) -> Result<(), ContainerError> {
        self.inner.engine.lock().link_apply(self.inner.handle, setting)?;
        Ok(())
    }

    pub fn handler(&self) -> Option<HandlerRef> {
        self.inner.handler.lock().clone()
    }

    pub fn set_handler(&self, handler: HandlerRef) {
        *self.inner.handler.lock() = Some(handler);
    }

    pub fn into_sender(self) -> Option<Sender> {
        if self.is_sender() {
            Some(Sender(self))
        } else {
            None
        }
    }

    pub fn into_receiver(self) -> Option<Receiver> {
        if self.is_receiver() {
            Some(Receiver(self))
        } else {
            None
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("handle", &self.inner.handle)
            .field("role", &self.inner.role)
            .field("name", &self.inner.name)
            .finish()
    }
}

/// Outgoing link
#[derive(Clone, Debug)]
pub struct Sender(Link);

impl Sender {
    pub(crate) fn new(link: Link) -> Self {
        Sender(link)
    }

    /// Send an already encoded message
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<DeliveryHandle, ContainerError> {
        Ok(self.0.engine().lock().send(self.0.handle(), payload.into())?)
    }

    pub fn link(&self) -> &Link {
        &self.0
    }
}

impl Deref for Sender {
    type Target = Link;

    fn deref(&self) -> &Link {
        &self.0
    }
}

/// Incoming link
#[derive(Clone, Debug)]
pub struct Receiver(Link);

impl Receiver {
    pub(crate) fn new(link: Link) -> Self {
        Receiver(link)
    }

    pub fn link(&self) -> &Link {
        &self.0
    }
}

impl Deref for Receiver {
    type Target = Link;

    fn deref(&self) -> &Link {
        &self.0
    }
}

/// Options for `Session::open_sender` / `Session::open_receiver`
///
/// Addresses are only written to a terminus that has none yet.
#[derive(Clone, Default)]
pub struct LinkOptions {
    pub name: Option<String>,
    pub source: Option<String>,
    pub target: Option<String>,
    /// Ask the peer to assign the address (target for senders, source for receivers)
    pub dynamic: bool,
    pub handler: Option<HandlerRef>,
    pub settings: Vec<LinkSetting>,
}

impl LinkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    pub fn with_handler(mut self, handler: HandlerRef) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_setting(mut self, setting: LinkSetting) -> Self {
        self.settings.push(setting);
        self
    }

    pub fn with_settings(mut self, settings: impl IntoIterator<Item = LinkSetting>) -> Self {
        self.settings.extend(settings);
        self
    }
}

impl fmt::Debug for LinkOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkOptions")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("target", &self.target)
            .field("dynamic", &self.dynamic)
            .field("handler", &self.handler.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}
