//! 容器配置
//!
//! 容器级缺省值：容器ID、重连退避策略、心跳、SASL 选项和事件通道容量。
//! 连接级的 `ConnectOptions` 没有给出的字段都从这里取。

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ContainerError;

/// 以毫秒整数序列化 `Duration`
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}

/// 重连退避配置
///
/// 第一次失败后立即重试（`immediate_first_retry`），之后从 `initial_delay`
/// 开始按 `multiplier` 递增，最大不超过 `max_delay`。
/// `max_attempts` 为 `None` 时永不放弃，直到容器关闭。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(rename = "initial_delay_ms", with = "millis")]
    pub initial_delay: Duration,
    pub multiplier: f64,
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
    pub immediate_first_retry: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            max_attempts: None,
            immediate_first_retry: true,
        }
    }
}

impl BackoffConfig {
    /// 固定次数的指数退避
    pub fn exponential(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_attempts: Some(max_attempts),
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_immediate_first_retry(mut self, immediate: bool) -> Self {
        self.immediate_first_retry = immediate;
        self
    }

    pub fn validate(&self) -> Result<(), ContainerError> {
        if !(self.multiplier >= 1.0) {
            return Err(ContainerError::config_error(
                "backoff.multiplier",
                format!("must be >= 1.0, got {}", self.multiplier),
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(ContainerError::config_error(
                "backoff.initial_delay",
                format!("{:?} exceeds max_delay {:?}", self.initial_delay, self.max_delay),
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(ContainerError::config_error(
                "backoff.max_attempts",
                "must be at least 1; use ReconnectPolicy::Disabled to turn reconnect off",
            ));
        }
        Ok(())
    }
}

/// 容器级配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// 缺省时生成随机 UUID
    pub container_id: Option<String>,
    pub reconnect: BackoffConfig,
    #[serde(rename = "heartbeat_ms", with = "millis::option")]
    pub heartbeat: Option<Duration>,
    pub sasl_enabled: bool,
    pub allow_insecure_mechs: bool,
    pub allowed_mechs: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// 事件广播通道容量
    pub event_capacity: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            container_id: None,
            reconnect: BackoffConfig::default(),
            heartbeat: None,
            sasl_enabled: true,
            allow_insecure_mechs: false,
            allowed_mechs: None,
            user: None,
            password: None,
            event_capacity: 1024,
        }
    }
}

impl ContainerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_container_id(mut self, id: impl Into<String>) -> Self {
        self.container_id = Some(id.into());
        self
    }

    pub fn with_reconnect(mut self, reconnect: BackoffConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ContainerError> {
        if let Some(id) = &self.container_id {
            if id.trim().is_empty() {
                return Err(ContainerError::config_error("container_id", "must not be blank"));
            }
        }
        if self.event_capacity == 0 {
            return Err(ContainerError::config_error("event_capacity", "must be greater than 0"));
        }
        if self.heartbeat == Some(Duration::ZERO) {
            return Err(ContainerError::config_error("heartbeat", "must be greater than 0"));
        }
        self.reconnect.validate()
    }

    /// 从环境变量读取，未设置或无法解析的变量保留缺省值
    ///
    /// - `AMQP_CONTAINER_ID`
    /// - `AMQP_RECONNECT_MAX_ATTEMPTS`
    /// - `AMQP_HEARTBEAT_MS`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("AMQP_CONTAINER_ID") {
            if !id.trim().is_empty() {
                tracing::info!("环境变量指定容器ID: {}", id);
                config.container_id = Some(id);
            }
        }

        if let Ok(value) = std::env::var("AMQP_RECONNECT_MAX_ATTEMPTS") {
            match value.parse::<u32>() {
                Ok(attempts) => {
                    tracing::info!("环境变量指定最大重连次数: {}", attempts);
                    config.reconnect.max_attempts = Some(attempts);
                }
                Err(_) => tracing::warn!("无法解析 AMQP_RECONNECT_MAX_ATTEMPTS={}, 使用缺省值", value),
            }
        }

        if let Ok(value) = std::env::var("AMQP_HEARTBEAT_MS") {
            match value.parse::<u64>() {
                Ok(ms) => {
                    tracing::info!("环境变量指定心跳间隔: {}ms", ms);
                    config.heartbeat = Some(Duration::from_millis(ms));
                }
                Err(_) => tracing::warn!("无法解析 AMQP_HEARTBEAT_MS={}, 使用缺省值", value),
            }
        }

        config
    }
}
