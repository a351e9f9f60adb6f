//! 连接器：地址轮询、重连退避与 TLS 域选择
//!
//! 每个由 `Container::connect` 创建的连接都有一个连接器。连接失败时由容器询问
//! 连接器下一次重试的延迟，连接器决定用哪个地址、带哪些传输参数。

use std::time::Duration;

use crate::{
    address::{AmqpUrl, UrlList},
    config::BackoffConfig,
    error::ContainerError,
    reactor::TransportTarget,
    tls::{SslConfig, TlsDomain},
};

/// 指数退避
///
/// `next` 返回下一次重试前的等待时间，`None` 表示次数用尽。
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
    delay: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let delay = config.initial_delay;
        Self {
            config,
            attempts: 0,
            delay,
        }
    }

    pub fn next(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_attempts {
            if self.attempts >= max {
                return None;
            }
        }
        self.attempts += 1;

        if self.attempts == 1 && self.config.immediate_first_retry {
            return Some(Duration::ZERO);
        }

        let current = self.delay.min(self.config.max_delay);
        let grown = current.as_nanos() as f64 * self.config.multiplier;
        let cap = self.config.max_delay.as_nanos() as f64;
        self.delay = Duration::from_nanos(grown.min(cap) as u64);
        Some(current)
    }

    /// 连接成功后回到初始状态
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.delay = self.config.initial_delay;
    }

    /// 自上次 reset 以来的重试次数
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

/// 重连策略
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectPolicy {
    Backoff(BackoffConfig),
    Disabled,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Backoff(BackoffConfig::default())
    }
}

/// SASL 与主机名相关的连接参数
#[derive(Debug, Clone, Default)]
pub struct TransportSettings {
    pub heartbeat: Option<Duration>,
    pub virtual_host: Option<String>,
    pub sni: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub sasl_enabled: bool,
    pub allowed_mechs: Option<String>,
    pub allow_insecure_mechs: bool,
}

#[derive(Debug)]
pub struct Connector {
    connection_id: String,
    urls: UrlList,
    backoff: Option<Backoff>,
    tls: Option<TlsDomain>,
    settings: TransportSettings,
    attempted: Vec<AmqpUrl>,
    cancelled: bool,
}

impl Connector {
    pub fn new(
        connection_id: impl Into<String>,
        urls: UrlList,
        policy: ReconnectPolicy,
        tls: Option<TlsDomain>,
        settings: TransportSettings,
    ) -> Self {
        let backoff = match policy {
            ReconnectPolicy::Backoff(config) => Some(Backoff::new(config)),
            ReconnectPolicy::Disabled => None,
        };
        Self {
            connection_id: connection_id.into(),
            urls,
            backoff,
            tls,
            settings,
            attempted: Vec::new(),
            cancelled: false,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// 取下一个地址，组装本次尝试的传输参数
    ///
    /// `amqps` 地址在既没有显式 TLS 域、容器也没有客户端 TLS 配置时失败。
    pub fn next_target(&mut self, ssl: &SslConfig) -> Result<TransportTarget, ContainerError> {
        let url = self.urls.next().clone();
        self.attempted.push(url.clone());

        let tls = if url.is_secure() {
            let domain = self
                .tls
                .clone()
                .or_else(|| ssl.client().cloned())
                .ok_or_else(|| ContainerError::tls_error(format!("amqps: no TLS domain available for {}", url)))?;
            Some(domain)
        } else {
            None
        };

        let sni = tls.as_ref().map(|_| {
            self.settings
                .sni
                .clone()
                .or_else(|| self.settings.virtual_host.clone())
                .unwrap_or_else(|| url.host().to_string())
        });

        let user = url.username().map(str::to_string).or_else(|| self.settings.user.clone());
        let password = url.password().map(str::to_string).or_else(|| self.settings.password.clone());

        Ok(TransportTarget {
            tls,
            sni,
            heartbeat: self.settings.heartbeat,
            virtual_host: self.settings.virtual_host.clone(),
            user,
            password,
            sasl_enabled: self.settings.sasl_enabled,
            allowed_mechs: self.settings.allowed_mechs.clone(),
            allow_insecure_mechs: self.settings.allow_insecure_mechs,
            url,
        })
    }

    /// 打开帧使用的主机名：虚拟主机优先，否则用地址里的主机
    pub fn hostname_for(&self, url: &AmqpUrl) -> String {
        self.settings
            .virtual_host
            .clone()
            .unwrap_or_else(|| url.host().to_string())
    }

    pub fn on_opened(&mut self) {
        if let Some(backoff) = self.backoff.as_mut() {
            backoff.reset();
        }
    }

    /// 连接失败后的重试延迟；未启用重连、已取消或次数用尽时为 `None`
    pub fn on_failure(&mut self) -> Option<Duration> {
        if self.cancelled {
            return None;
        }
        self.backoff.as_mut()?.next()
    }

    pub fn reconnect_enabled(&self) -> bool {
        self.backoff.is_some()
    }

    /// 当前这一轮已经重试的次数
    pub fn retries(&self) -> u32 {
        self.backoff.as_ref().map(Backoff::attempts).unwrap_or(0)
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// 按顺序记录的所有尝试地址
    pub fn attempted(&self) -> &[AmqpUrl] {
        &self.attempted
    }

    pub fn urls(&self) -> &UrlList {
        &self.urls
    }
}
