use std::fmt;

/// 协议引擎报告的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineErrorKind {
    /// 链路名称在同一对容器之间重复
    NameCollision,
    /// 引擎资源耗尽（句柄、通道号等）
    ResourceExhausted,
    /// 违反协议状态机
    ProtocolViolation,
    /// 句柄不存在或已释放
    InvalidHandle,
    /// 底层 I/O 失败
    Io,
    Other,
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineErrorKind::NameCollision => "name collision",
            EngineErrorKind::ResourceExhausted => "resource exhausted",
            EngineErrorKind::ProtocolViolation => "protocol violation",
            EngineErrorKind::InvalidHandle => "invalid handle",
            EngineErrorKind::Io => "io",
            EngineErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// 外部协议引擎返回的错误，容器层原样向上传播
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("engine error ({kind}): {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn name_collision(name: impl fmt::Display) -> Self {
        Self::new(EngineErrorKind::NameCollision, format!("link name '{}' already in use", name))
    }

    pub fn invalid_handle(handle: impl fmt::Display) -> Self {
        Self::new(EngineErrorKind::InvalidHandle, format!("unknown handle {}", handle))
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Io, message)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(error: std::io::Error) -> Self {
        EngineError::io(error.to_string())
    }
}

/// 容器层统一错误类型
#[derive(Debug, Clone, thiserror::Error)]
pub enum ContainerError {
    /// 配置错误：缺失或冲突的选项
    #[error("Configuration error in field '{field}': {reason}")]
    Configuration {
        field: String,
        reason: String,
    },

    /// 引擎错误：原样透传
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// 重连策略耗尽
    #[error("Reconnect exhausted for connection '{connection_id}' after {attempts} attempts")]
    ReconnectExhausted {
        connection_id: String,
        attempts: u32,
    },

    /// TLS 配置不可用或无效
    #[error("TLS error: {reason}")]
    Tls {
        reason: String,
    },

    /// 地址解析失败
    #[error("Invalid URL '{url}': {reason}")]
    Url {
        url: String,
        reason: String,
    },

    /// 包装对象的父连接已经被销毁
    #[error("{entity} is detached from its connection")]
    Detached {
        entity: String,
    },
}

/// 便利构造函数
impl ContainerError {
    /// 创建配置错误
    pub fn config_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn tls_error(reason: impl Into<String>) -> Self {
        Self::Tls {
            reason: reason.into(),
        }
    }

    pub fn url_error(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Url {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn detached(entity: impl Into<String>) -> Self {
        Self::Detached {
            entity: entity.into(),
        }
    }

    /// 判断错误是否可重试
    ///
    /// 只有连接建立阶段的 I/O 错误可以重试，其它错误重试也不会改变结果
    pub fn is_retryable(&self) -> bool {
        match self {
            ContainerError::Engine(e) => e.kind == EngineErrorKind::Io,
            _ => false,
        }
    }

    /// 获取错误代码
    pub fn error_code(&self) -> &'static str {
        match self {
            ContainerError::Configuration { .. } => "CONFIG_ERROR",
            ContainerError::Engine(_) => "ENGINE_ERROR",
            ContainerError::ReconnectExhausted { .. } => "RECONNECT_EXHAUSTED",
            ContainerError::Tls { .. } => "TLS_ERROR",
            ContainerError::Url { .. } => "URL_ERROR",
            ContainerError::Detached { .. } => "DETACHED",
        }
    }
}

impl From<rustls::Error> for ContainerError {
    fn from(error: rustls::Error) -> Self {
        ContainerError::tls_error(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_passes_through_unchanged() {
        let engine = EngineError::name_collision("orders");
        let err: ContainerError = engine.clone().into();

        // transparent：显示内容与引擎错误一致
        assert_eq!(err.to_string(), engine.to_string());
        match err {
            ContainerError::Engine(inner) => assert_eq!(inner, engine),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_retryable_and_codes() {
        assert!(ContainerError::from(EngineError::io("refused")).is_retryable());
        assert!(!ContainerError::config_error("url", "missing").is_retryable());
        assert_eq!(ContainerError::config_error("url", "missing").error_code(), "CONFIG_ERROR");
        assert_eq!(
            ContainerError::ReconnectExhausted { connection_id: "c/1".into(), attempts: 3 }.error_code(),
            "RECONNECT_EXHAUSTED"
        );
    }
}
