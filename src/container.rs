//! 容器：AMQP 端点的顶层对象
//!
//! 容器持有容器ID、连接ID生成器、默认 TLS 配置和全局事件处理链。
//! 连接、会话与链路都从这里创建；连接失败后的重连由每个连接的 `Connector`
//! 决定延迟，由 `do_work` 驱动定时器。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::{
    address::{AmqpUrl, UrlList},
    config::ContainerConfig,
    connection::Connection,
    connector::{Connector, ReconnectPolicy, TransportSettings},
    engine::{ConnectionHandle, EndpointState, LinkHandle, SessionHandle, SharedEngine},
    error::ContainerError,
    event::{dispatch, ContainerEvent, HandlerRef},
    link::{LinkOptions, Receiver, Sender},
    reactor::{AcceptorHandle, Reactor, ReactorEvent},
    session::Session,
    stream::ContainerEventStream,
    tls::{SslConfig, TlsDomain},
    transaction::{open_txn_ctl, OutcomeRoutes, Transaction, TransactionHandler},
    util::{ContainerId, IdFactory},
};

/// `create_sender` / `create_receiver` / `declare_transaction` 的上下文
///
/// 地址字符串按 URL 解析；URL 会隐式建立新连接并使用其路径作为地址；
/// 连接解析为它的默认会话；会话直接使用。
#[derive(Debug, Clone)]
pub enum Context {
    Address(String),
    Url(AmqpUrl),
    Session(Session),
    Connection(Connection),
}

impl From<&str> for Context {
    fn from(address: &str) -> Self {
        Context::Address(address.to_string())
    }
}

impl From<String> for Context {
    fn from(address: String) -> Self {
        Context::Address(address)
    }
}

impl From<AmqpUrl> for Context {
    fn from(url: AmqpUrl) -> Self {
        Context::Url(url)
    }
}

impl From<Session> for Context {
    fn from(session: Session) -> Self {
        Context::Session(session)
    }
}

impl From<&Session> for Context {
    fn from(session: &Session) -> Self {
        Context::Session(session.clone())
    }
}

impl From<Connection> for Context {
    fn from(connection: Connection) -> Self {
        Context::Connection(connection)
    }
}

impl From<&Connection> for Context {
    fn from(connection: &Connection) -> Self {
        Context::Connection(connection.clone())
    }
}

/// `Container::connect` 的选项
///
/// `url`、`urls`、`address` 必须且只能设置一个。未设置的 SASL 字段取容器配置。
#[derive(Clone, Default)]
pub struct ConnectOptions {
    pub url: Option<AmqpUrl>,
    pub urls: Option<UrlList>,
    pub address: Option<String>,
    pub handler: Option<HandlerRef>,
    /// 缺省使用容器配置里的退避参数
    pub reconnect: Option<ReconnectPolicy>,
    pub heartbeat: Option<Duration>,
    /// 显式 TLS 域，优先于容器的默认客户端配置
    pub tls: Option<TlsDomain>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub virtual_host: Option<String>,
    pub sni: Option<String>,
    pub sasl_enabled: Option<bool>,
    pub allowed_mechs: Option<String>,
    pub allow_insecure_mechs: Option<bool>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url(url: AmqpUrl) -> Self {
        Self {
            url: Some(url),
            ..Self::default()
        }
    }

    pub fn urls(urls: UrlList) -> Self {
        Self {
            urls: Some(urls),
            ..Self::default()
        }
    }

    pub fn address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    pub fn with_handler(mut self, handler: HandlerRef) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    pub fn without_reconnect(self) -> Self {
        self.with_reconnect(ReconnectPolicy::Disabled)
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn with_tls(mut self, tls: TlsDomain) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_virtual_host(mut self, virtual_host: impl Into<String>) -> Self {
        self.virtual_host = Some(virtual_host.into());
        self
    }

    pub fn with_sni(mut self, sni: impl Into<String>) -> Self {
        self.sni = Some(sni.into());
        self
    }

    pub fn with_sasl(mut self, enabled: bool) -> Self {
        self.sasl_enabled = Some(enabled);
        self
    }

    pub fn with_allowed_mechs(mut self, mechs: impl Into<String>) -> Self {
        self.allowed_mechs = Some(mechs.into());
        self
    }

    pub fn with_allow_insecure_mechs(mut self, allow: bool) -> Self {
        self.allow_insecure_mechs = Some(allow);
        self
    }

    /// 把三种寻址方式归一成地址列表
    fn resolve_urls(&self) -> Result<UrlList, ContainerError> {
        let given = [self.url.is_some(), self.urls.is_some(), self.address.is_some()]
            .iter()
            .filter(|set| **set)
            .count();
        match given {
            0 => return Err(ContainerError::config_error("url", "one of url, urls or address is required")),
            1 => {}
            _ => return Err(ContainerError::config_error("url", "url, urls and address are mutually exclusive")),
        }

        if let Some(url) = &self.url {
            return Ok(UrlList::single(url.clone()));
        }
        if let Some(urls) = &self.urls {
            return Ok(urls.clone());
        }
        match &self.address {
            Some(address) => Ok(UrlList::single(AmqpUrl::parse(address)?)),
            None => Err(ContainerError::config_error("address", "missing")),
        }
    }

    fn transport_settings(&self, config: &ContainerConfig) -> TransportSettings {
        TransportSettings {
            heartbeat: self.heartbeat.or(config.heartbeat),
            virtual_host: self.virtual_host.clone(),
            sni: self.sni.clone(),
            user: self.user.clone().or_else(|| config.user.clone()),
            password: self.password.clone().or_else(|| config.password.clone()),
            sasl_enabled: self.sasl_enabled.unwrap_or(config.sasl_enabled),
            allowed_mechs: self.allowed_mechs.clone().or_else(|| config.allowed_mechs.clone()),
            allow_insecure_mechs: self.allow_insecure_mechs.unwrap_or(config.allow_insecure_mechs),
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("url", &self.url)
            .field("urls", &self.urls)
            .field("address", &self.address)
            .field("handler", &self.handler.is_some())
            .field("reconnect", &self.reconnect)
            .field("heartbeat", &self.heartbeat)
            .field("tls", &self.tls)
            .field("user", &self.user)
            .field("virtual_host", &self.virtual_host)
            .finish()
    }
}

/// 正在监听的入站端点
#[derive(Debug, Clone)]
pub struct Acceptor {
    handle: AcceptorHandle,
    url: AmqpUrl,
    tls: Option<TlsDomain>,
}

impl Acceptor {
    pub fn handle(&self) -> AcceptorHandle {
        self.handle
    }

    pub fn url(&self) -> &AmqpUrl {
        &self.url
    }

    pub fn tls(&self) -> Option<&TlsDomain> {
        self.tls.as_ref()
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }
}

/// 一次失败之后的处理结果
enum Retry {
    /// 立即尝试下一个地址
    Now,
    /// 已登记定时器
    Later,
    /// 不再重连
    Stopped,
}

pub struct Container {
    id: Arc<ContainerId>,
    connection_ids: IdFactory,
    config: ContainerConfig,
    engine: SharedEngine,
    reactor: Box<dyn Reactor>,
    ssl: SslConfig,
    handlers: Vec<HandlerRef>,
    events: broadcast::Sender<ContainerEvent>,
    connections: HashMap<ConnectionHandle, Connection>,
    connectors: HashMap<ConnectionHandle, Connector>,
    timers: HashMap<ConnectionHandle, Instant>,
    acceptors: HashMap<AcceptorHandle, Acceptor>,
    routes: OutcomeRoutes,
    closed: bool,
}

impl Container {
    /// 创建容器；配置不合法时直接失败
    pub fn new(
        engine: SharedEngine,
        reactor: impl Reactor + 'static,
        config: ContainerConfig,
    ) -> Result<Self, ContainerError> {
        config.validate()?;
        let id = Arc::new(ContainerId::new(config.container_id.as_deref()));
        let (events, _) = broadcast::channel(config.event_capacity);
        tracing::info!("创建容器 {}", id);

        Ok(Self {
            connection_ids: IdFactory::new(id.as_str()),
            id,
            config,
            engine,
            reactor: Box::new(reactor),
            ssl: SslConfig::new()?,
            handlers: Vec::new(),
            events,
            connections: HashMap::new(),
            connectors: HashMap::new(),
            timers: HashMap::new(),
            acceptors: HashMap::new(),
            routes: Arc::new(Mutex::new(HashMap::new())),
            closed: false,
        })
    }

    pub fn id(&self) -> &str {
        self.id.as_str()
    }

    pub fn container_id(&self) -> &ContainerId {
        &self.id
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn ssl(&self) -> &SslConfig {
        &self.ssl
    }

    pub fn ssl_mut(&mut self) -> &mut SslConfig {
        &mut self.ssl
    }

    /// 追加一个全局处理器，排在链路和连接处理器之后
    pub fn add_handler(&mut self, handler: HandlerRef) {
        self.handlers.push(handler);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ContainerEvent> {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> ContainerEventStream {
        ContainerEventStream::new(self.events.subscribe())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn connection(&self, handle: ConnectionHandle) -> Option<Connection> {
        self.connections.get(&handle).cloned()
    }

    pub fn connections(&self) -> Vec<Connection> {
        let mut connections: Vec<Connection> = self.connections.values().cloned().collect();
        connections.sort_by_key(Connection::handle);
        connections
    }

    pub fn connector(&self, handle: ConnectionHandle) -> Option<&Connector> {
        self.connectors.get(&handle)
    }

    /// 等待中的重连定时器数量
    pub fn pending_reconnects(&self) -> usize {
        self.timers.len()
    }

    pub fn acceptors(&self) -> Vec<Acceptor> {
        self.acceptors.values().cloned().collect()
    }

    /// 发起连接
    ///
    /// 只发起，不等待握手完成；成功与失败都通过事件观察。
    /// 寻址选项缺失或冲突时在调用引擎之前失败。
    pub async fn connect(&mut self, options: ConnectOptions) -> Result<Connection, ContainerError> {
        if self.closed {
            return Err(ContainerError::config_error("container", "container is closed"));
        }
        let urls = options.resolve_urls()?;
        let policy = options
            .reconnect
            .clone()
            .unwrap_or_else(|| ReconnectPolicy::Backoff(self.config.reconnect.clone()));
        if let ReconnectPolicy::Backoff(backoff) = &policy {
            backoff.validate()?;
        }
        if urls.iter().any(AmqpUrl::is_secure) && options.tls.is_none() && self.ssl.client().is_none() {
            return Err(ContainerError::tls_error("amqps requested but no client TLS domain is configured"));
        }

        let connection_id = self.connection_ids.next();
        let handle = {
            let mut engine = self.engine.lock();
            let handle = engine.connection_new()?;
            engine.connection_set_container(handle, self.id.as_str())?;
            handle
        };
        let connection = Connection::new(
            handle,
            self.engine.clone(),
            self.id.clone(),
            IdFactory::new(connection_id.clone()),
        );
        if let Some(handler) = options.handler.clone() {
            connection.set_handler(handler);
        }

        let settings = options.transport_settings(&self.config);
        let connector = Connector::new(connection_id.clone(), urls, policy, options.tls.clone(), settings);
        tracing::info!("连接 {} 创建 ({} 个候选地址)", connection_id, connector.urls().len());

        connection.open()?;
        self.connections.insert(handle, connection.clone());
        self.connectors.insert(handle, connector);

        self.attempt(handle).await?;
        Ok(connection)
    }

    /// 连续尝试，直到发起成功或者需要等待定时器
    async fn attempt(&mut self, handle: ConnectionHandle) -> Result<(), ContainerError> {
        loop {
            match self.try_connect(handle).await {
                Ok(()) => return Ok(()),
                Err(error) => match self.schedule_retry(handle, error.to_string())? {
                    Retry::Now => continue,
                    Retry::Later | Retry::Stopped => return Ok(()),
                },
            }
        }
    }

    async fn try_connect(&mut self, handle: ConnectionHandle) -> Result<(), ContainerError> {
        let connector = self
            .connectors
            .get_mut(&handle)
            .ok_or_else(|| ContainerError::detached(format!("connector for {}", handle)))?;
        let target = connector.next_target(&self.ssl)?;
        let hostname = connector.hostname_for(&target.url);
        let connection_id = connector.connection_id().to_string();
        let attempt = connector.attempted().len() as u32;

        self.engine.lock().connection_set_hostname(handle, &hostname)?;
        tracing::debug!("连接 {} 第 {} 次尝试: {}", connection_id, attempt, target.url);
        self.emit(ContainerEvent::ConnectionAttempt {
            connection: handle,
            connection_id,
            url: target.url.to_string(),
            attempt,
        });

        self.reactor.connect(handle, target).await?;
        Ok(())
    }

    /// 连接级失败：决定立即重试、定时重试还是放弃
    fn schedule_retry(&mut self, handle: ConnectionHandle, reason: String) -> Result<Retry, ContainerError> {
        self.emit(ContainerEvent::TransportError {
            connection: handle,
            error: reason.clone(),
        });

        let Some(connection) = self.connections.get(&handle).cloned() else {
            return Ok(Retry::Stopped);
        };
        let reconnecting = !self.closed
            && connection.state()?.contains(EndpointState::LOCAL_ACTIVE)
            && self
                .connectors
                .get(&handle)
                .map_or(false, |c| c.reconnect_enabled() && !c.is_cancelled());
        if !reconnecting {
            tracing::info!("连接 {} 断开，不再重连: {}", connection.id(), reason);
            if let Err(error) = self.retire(handle) {
                tracing::warn!("释放连接 {} 失败: {}", connection.id(), error);
            }
            return Ok(Retry::Stopped);
        }
        let Some(connector) = self.connectors.get_mut(&handle) else {
            return Ok(Retry::Stopped);
        };

        let connection_id = connector.connection_id().to_string();
        match connector.on_failure() {
            Some(delay) => {
                let attempt = connector.retries();
                tracing::info!("连接 {} 将在 {:?} 后重连 (第{}次): {}", connection_id, delay, attempt, reason);
                self.emit(ContainerEvent::ReconnectScheduled {
                    connection: handle,
                    connection_id,
                    delay,
                    attempt,
                });
                if delay.is_zero() {
                    Ok(Retry::Now)
                } else {
                    self.timers.insert(handle, Instant::now() + delay);
                    Ok(Retry::Later)
                }
            }
            None => {
                let attempts = connector.retries();
                connector.cancel();
                tracing::warn!("连接 {} 重连次数用尽 ({} 次)", connection_id, attempts);
                self.emit(ContainerEvent::ReconnectExhausted {
                    connection: handle,
                    connection_id: connection_id.clone(),
                    attempts,
                });
                if let Err(error) = self.retire(handle) {
                    tracing::warn!("释放连接 {} 失败: {}", connection.id(), error);
                }
                Err(ContainerError::ReconnectExhausted {
                    connection_id,
                    attempts,
                })
            }
        }
    }

    /// 连接进入终态：移出容器，关闭本地端点并释放引擎资源
    ///
    /// 关闭失败时仍然释放，返回关闭时的错误。
    fn retire(&mut self, handle: ConnectionHandle) -> Result<(), ContainerError> {
        self.timers.remove(&handle);
        self.connectors.remove(&handle);
        self.routes
            .lock()
            .retain(|_, transaction| transaction.txn_ctl().link().connection_handle() != handle);
        let Some(connection) = self.connections.remove(&handle) else {
            return Ok(());
        };
        let closed = connection.close_all();
        connection.release();
        tracing::debug!("连接 {} 已释放", connection.id());
        closed
    }

    /// 解析上下文得到会话；URL 上下文额外返回其路径
    async fn resolve_session(&mut self, context: Context) -> Result<(Session, Option<String>), ContainerError> {
        let url = match context {
            Context::Session(session) => return Ok((session, None)),
            Context::Connection(connection) => return Ok((connection.default_session()?, None)),
            Context::Address(address) => AmqpUrl::parse(&address)?,
            Context::Url(url) => url,
        };
        let path = url.path().map(str::to_string);
        let connection = self.connect(ConnectOptions::url(url)).await?;
        Ok((connection.default_session()?, path))
    }

    /// 在上下文对应的会话上打开发送端；URL 路径作为缺省目标地址
    pub async fn create_sender(
        &mut self,
        context: impl Into<Context>,
        mut options: LinkOptions,
    ) -> Result<Sender, ContainerError> {
        let (session, path) = self.resolve_session(context.into()).await?;
        if let Some(path) = path {
            options.target.get_or_insert(path);
        }
        session.open_sender(options)
    }

    /// 在上下文对应的会话上打开接收端；URL 路径作为缺省源地址
    pub async fn create_receiver(
        &mut self,
        context: impl Into<Context>,
        mut options: LinkOptions,
    ) -> Result<Receiver, ContainerError> {
        let (session, path) = self.resolve_session(context.into()).await?;
        if let Some(path) = path {
            options.source.get_or_insert(path);
        }
        session.open_receiver(options)
    }

    /// 声明本地事务
    ///
    /// 每个会话只有一条事务控制链路，第一次声明时创建，之后复用。
    pub async fn declare_transaction(
        &mut self,
        context: impl Into<Context>,
        handler: Option<Arc<dyn TransactionHandler>>,
        settle_before_discharge: bool,
    ) -> Result<Transaction, ContainerError> {
        let (session, _) = self.resolve_session(context.into()).await?;
        let txn_ctl = session.txn_ctl_or_try_init(open_txn_ctl)?;
        Transaction::declare(txn_ctl, handler, settle_before_discharge, self.routes.clone())
    }

    /// 开始监听
    ///
    /// `amqps` 在没有显式 TLS 域时使用容器的服务端配置，两者都没有时失败。
    pub async fn listen(&mut self, url: &str, tls: Option<TlsDomain>) -> Result<Acceptor, ContainerError> {
        let url = AmqpUrl::parse(url)?;
        let tls = match tls {
            Some(tls) => Some(tls),
            None if url.is_secure() => Some(
                self.ssl
                    .server()
                    .cloned()
                    .ok_or_else(|| ContainerError::tls_error(format!("no server TLS credentials for {}", url)))?,
            ),
            None => None,
        };

        let handle = self.reactor.listen(url.host(), url.port(), tls.clone()).await?;
        tracing::info!("{} 监听 {}:{} (tls={})", handle, url.host(), url.port(), tls.is_some());
        let acceptor = Acceptor { handle, url, tls };
        self.acceptors.insert(handle, acceptor.clone());
        Ok(acceptor)
    }

    pub async fn close_acceptor(&mut self, handle: AcceptorHandle) -> Result<(), ContainerError> {
        if self.acceptors.remove(&handle).is_some() {
            self.reactor.close_acceptor(handle).await?;
            tracing::info!("关闭监听 {}", handle);
        }
        Ok(())
    }

    pub async fn close_acceptors(&mut self) -> Result<(), ContainerError> {
        let mut handles: Vec<AcceptorHandle> = self.acceptors.keys().copied().collect();
        handles.sort();
        for handle in handles {
            self.close_acceptor(handle).await?;
        }
        Ok(())
    }

    /// 唤醒阻塞在 `do_work` 里的事件循环
    pub fn wakeup(&self) {
        self.reactor.wakeup();
    }

    /// 驱动一轮事件处理
    ///
    /// 等待时间取 `timeout` 与最近的重连定时器中较早的一个。
    /// 返回本轮是否处理了任何事件或定时器。
    pub async fn do_work(&mut self, timeout: Option<Duration>) -> Result<bool, ContainerError> {
        let wait = match self.timers.values().min().copied() {
            Some(deadline) => {
                let until = deadline.saturating_duration_since(Instant::now());
                Some(timeout.map_or(until, |timeout| timeout.min(until)))
            }
            None => timeout,
        };

        let events = self.reactor.process(wait).await?;
        let mut worked = !events.is_empty();
        // 反应器交出的事件不会重发，出错也要处理完整批事件和到期定时器
        let mut first_error = None;

        for event in events {
            if let Err(error) = self.handle_reactor_event(event).await {
                tracing::warn!("处理反应器事件失败: {}", error);
                first_error.get_or_insert(error);
            }
        }

        let now = Instant::now();
        let mut due: Vec<ConnectionHandle> = self
            .timers
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(handle, _)| *handle)
            .collect();
        due.sort();
        for handle in due {
            self.timers.remove(&handle);
            worked = true;
            if let Err(error) = self.attempt(handle).await {
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(worked),
        }
    }

    async fn handle_reactor_event(&mut self, event: ReactorEvent) -> Result<(), ContainerError> {
        match event {
            ReactorEvent::ConnectionRemoteOpen { connection } => {
                let connection_id = match self.connectors.get_mut(&connection) {
                    Some(connector) => {
                        connector.on_opened();
                        connector.connection_id().to_string()
                    }
                    None => self
                        .connections
                        .get(&connection)
                        .map(Connection::id)
                        .unwrap_or_default(),
                };
                tracing::info!("连接 {} 已打开", connection_id);
                self.emit(ContainerEvent::ConnectionOpened {
                    connection,
                    connection_id,
                });
            }
            ReactorEvent::ConnectionRemoteClose { connection, condition } => {
                // 对端主动关闭，之后的传输断开不再重连
                if let Some(connector) = self.connectors.get_mut(&connection) {
                    connector.cancel();
                }
                self.timers.remove(&connection);
                tracing::info!("连接 {} 被对端关闭: {:?}", connection, condition);
                self.emit(ContainerEvent::ConnectionClosed { connection, condition });
            }
            ReactorEvent::TransportClosed { connection, error } => {
                let reason = error.unwrap_or_else(|| "transport closed".to_string());
                if let Retry::Now = self.schedule_retry(connection, reason)? {
                    self.attempt(connection).await?;
                }
            }
            ReactorEvent::ConnectionAccepted { acceptor, connection } => {
                self.engine.lock().connection_set_container(connection, self.id.as_str())?;
                let connection_id = self.connection_ids.next();
                let accepted = Connection::new(
                    connection,
                    self.engine.clone(),
                    self.id.clone(),
                    IdFactory::new(connection_id.clone()),
                );
                self.connections.insert(connection, accepted);
                tracing::info!("{} 接受连接 {}", acceptor, connection_id);
                self.emit(ContainerEvent::ConnectionAccepted { acceptor, connection });
            }
            ReactorEvent::SessionRemoteOpen { session } => {
                if let Some(connection) = self.owner_of_session(session) {
                    connection.wrap_session(session);
                    self.emit(ContainerEvent::SessionOpened {
                        connection: connection.handle(),
                        session,
                    });
                }
            }
            ReactorEvent::SessionRemoteClose { session, condition } => {
                if let Some(connection) = self.owner_of_session(session) {
                    self.emit(ContainerEvent::SessionClosed {
                        connection: connection.handle(),
                        session,
                        condition,
                    });
                }
            }
            ReactorEvent::LinkRemoteOpen { link } => {
                if let Some(connection) = self.owner_of_link(link) {
                    connection.wrap_link(link)?;
                    self.emit(ContainerEvent::LinkOpened {
                        connection: connection.handle(),
                        link,
                    });
                }
            }
            ReactorEvent::LinkRemoteClose { link, condition } => {
                if let Some(connection) = self.owner_of_link(link) {
                    self.emit(ContainerEvent::LinkClosed {
                        connection: connection.handle(),
                        link,
                        condition,
                    });
                }
            }
            ReactorEvent::DeliverySettled { link, delivery, outcome } => {
                let Some(connection) = self.owner_of_link(link) else {
                    return Ok(());
                };
                let transaction = self.routes.lock().remove(&delivery);
                if let Some(transaction) = transaction {
                    if let Some(event) = transaction.handle_outcome(delivery, &outcome)? {
                        self.emit(event);
                    }
                }
                self.emit(ContainerEvent::DeliverySettled {
                    connection: connection.handle(),
                    link,
                    delivery,
                    outcome,
                });
            }
        }
        Ok(())
    }

    fn owner_of_session(&self, session: SessionHandle) -> Option<Connection> {
        let owner = self.engine.lock().session_connection(session);
        match owner {
            Ok(handle) => self.connections.get(&handle).cloned(),
            Err(error) => {
                tracing::warn!("无法定位会话 {} 所属连接: {}", session, error);
                None
            }
        }
    }

    fn owner_of_link(&self, link: LinkHandle) -> Option<Connection> {
        let session = self.engine.lock().link_session(link);
        match session {
            Ok(session) => self.owner_of_session(session),
            Err(error) => {
                tracing::warn!("无法定位链路 {} 所属会话: {}", link, error);
                None
            }
        }
    }

    /// 依次交给链路处理器、连接处理器、全局处理器，然后广播
    fn emit(&self, event: ContainerEvent) {
        let connection = event.connection().and_then(|handle| self.connections.get(&handle));
        let link_handler = event
            .link()
            .zip(connection)
            .and_then(|(link, connection)| connection.find_link(link))
            .and_then(|link| link.handler());
        let connection_handler = connection.and_then(Connection::handler);

        let chain: Vec<HandlerRef> = link_handler
            .into_iter()
            .chain(connection_handler)
            .chain(self.handlers.iter().cloned())
            .collect();
        if dispatch(&chain, &event) {
            tracing::trace!("事件已被处理器消费: {:?}", event);
        }

        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(event);
    }

    /// 关闭容器
    ///
    /// 停止所有重连，关闭全部链路、会话和连接并交还引擎释放，清空定时器与缓存。
    /// 单个连接关闭失败不会中断其他连接的关闭，返回遇到的第一个错误。
    pub async fn close(&mut self) -> Result<(), ContainerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        tracing::info!("关闭容器 {}", self.id);

        for connector in self.connectors.values_mut() {
            connector.cancel();
        }

        let mut first_error = None;
        if let Err(error) = self.close_acceptors().await {
            tracing::warn!("关闭监听失败: {}", error);
            first_error.get_or_insert(error);
        }

        for connection in self.connections() {
            if let Err(error) = self.retire(connection.handle()) {
                tracing::warn!("关闭连接 {} 失败: {}", connection.id(), error);
                first_error.get_or_insert(error);
            }
        }
        self.timers.clear();
        self.routes.lock().clear();
        self.emit(ContainerEvent::ContainerClosed);

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id.as_str())
            .field("connections", &self.connections.len())
            .field("pending_reconnects", &self.timers.len())
            .field("acceptors", &self.acceptors.len())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MemoryEngine, Terminus};
    use crate::error::EngineError;
    use crate::reactor::TransportTarget;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingReactor {
        targets: Arc<Mutex<Vec<TransportTarget>>>,
    }

    #[async_trait]
    impl Reactor for RecordingReactor {
        async fn connect(&mut self, _connection: ConnectionHandle, target: TransportTarget) -> Result<(), EngineError> {
            self.targets.lock().push(target);
            Ok(())
        }

        async fn listen(&mut self, _host: &str, _port: u16, _tls: Option<TlsDomain>) -> Result<AcceptorHandle, EngineError> {
            Ok(AcceptorHandle::new(1))
        }

        async fn close_acceptor(&mut self, _acceptor: AcceptorHandle) -> Result<(), EngineError> {
            Ok(())
        }

        async fn process(&mut self, _timeout: Option<Duration>) -> Result<Vec<ReactorEvent>, EngineError> {
            Ok(Vec::new())
        }

        fn wakeup(&self) {}
    }

    fn container() -> (Arc<Mutex<MemoryEngine>>, Arc<Mutex<Vec<TransportTarget>>>, Container) {
        let engine = Arc::new(Mutex::new(MemoryEngine::new()));
        let shared: SharedEngine = engine.clone();
        let reactor = RecordingReactor::default();
        let targets = reactor.targets.clone();
        let config = ContainerConfig::new().with_container_id("unit");
        let container = Container::new(shared, reactor, config).unwrap();
        (engine, targets, container)
    }

    #[tokio::test]
    async fn test_connect_requires_one_address() {
        let (engine, targets, mut container) = container();

        let err = container.connect(ConnectOptions::new()).await.unwrap_err();
        assert!(matches!(err, ContainerError::Configuration { .. }));

        let mut both = ConnectOptions::address("amqp://a");
        both.url = Some(AmqpUrl::parse("amqp://b").unwrap());
        let err = container.connect(both).await.unwrap_err();
        assert!(matches!(err, ContainerError::Configuration { .. }));

        assert!(targets.lock().is_empty());
        assert_eq!(engine.lock().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_assigns_ids_and_opens() {
        let (engine, targets, mut container) = container();
        let first = container.connect(ConnectOptions::address("amqp://h1/q")).await.unwrap();
        let second = container.connect(ConnectOptions::address("amqp://h2")).await.unwrap();

        assert_eq!(first.id(), "unit/1");
        assert_eq!(second.id(), "unit/2");
        assert_eq!(first.container_id(), "unit");
        assert!(first.state().unwrap().contains(EndpointState::LOCAL_ACTIVE));
        assert_eq!(engine.lock().connection_hostname(first.handle()).as_deref(), Some("h1"));
        assert_eq!(targets.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_create_sender_from_url_uses_path() {
        let (_engine, _targets, mut container) = container();
        let sender = container
            .create_sender("amqp://broker/orders", LinkOptions::new())
            .await
            .unwrap();
        assert_eq!(sender.target_address().unwrap().as_deref(), Some("orders"));
        assert!(sender.name().ends_with("@unit"));

        let receiver = container
            .create_receiver("amqp://broker/orders", LinkOptions::new().with_source("explicit"))
            .await
            .unwrap();
        assert_eq!(receiver.address(Terminus::Source).unwrap().as_deref(), Some("explicit"));
    }

    #[tokio::test]
    async fn test_connection_context_uses_default_session() {
        let (_engine, _targets, mut container) = container();
        let connection = container.connect(ConnectOptions::address("amqp://h")).await.unwrap();

        let sender = container.create_sender(&connection, LinkOptions::new()).await.unwrap();
        let receiver = container.create_receiver(&connection, LinkOptions::new()).await.unwrap();
        assert_eq!(sender.session_handle(), receiver.session_handle());
        assert_eq!(sender.session_handle(), connection.default_session().unwrap().handle());
    }

    #[tokio::test]
    async fn test_listen_amqps_requires_credentials() {
        let (_engine, _targets, mut container) = container();
        let err = container.listen("amqps://0.0.0.0:5671", None).await.unwrap_err();
        assert!(matches!(err, ContainerError::Tls { .. }));

        let acceptor = container.listen("amqp://0.0.0.0:5672", None).await.unwrap();
        assert!(!acceptor.is_secure());
        assert_eq!(container.acceptors().len(), 1);
        container.close_acceptor(acceptor.handle()).await.unwrap();
        assert!(container.acceptors().is_empty());
    }

    #[tokio::test]
    async fn test_close_closes_everything() {
        let (engine, _targets, mut container) = container();
        let mut events = container.subscribe_events();
        let sender = container
            .create_sender("amqp://h/q", LinkOptions::new())
            .await
            .unwrap();
        let connection = sender.connection().unwrap();

        container.close().await.unwrap();
        assert!(container.is_closed());
        assert!(connection.state().unwrap().contains(EndpointState::LOCAL_CLOSED));
        assert!(connection.is_released());
        assert!(connection.links().is_empty());
        assert!(sender.state().is_err());
        assert!(container.connections().is_empty());
        assert_eq!(engine.lock().connection_count(), 0);
        assert_eq!(engine.lock().link_count(), 0);

        let mut saw_closed = false;
        while let Ok(event) = events.try_recv() {
            saw_closed |= event == ContainerEvent::ContainerClosed;
        }
        assert!(saw_closed);

        let err = container.connect(ConnectOptions::address("amqp://h")).await.unwrap_err();
        assert!(matches!(err, ContainerError::Configuration { .. }));
    }
}
