//! AMQP 地址解析
//!
//! 接受 `[scheme://][user[:password]@]host[:port][/path]`，缺省 scheme 为 `amqp`，
//! 缺省端口按 scheme 决定（`amqp` 5672，`amqps` 5671），`path` 去掉开头的 `/`
//! 之后作为节点地址使用。

use std::fmt;
use std::str::FromStr;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::error::ContainerError;

pub const AMQP_PORT: u16 = 5672;
pub const AMQPS_PORT: u16 = 5671;
const DEFAULT_HOST: &str = "0.0.0.0";

/// 显示时需要转义的路径字符，保证 `to_string` 之后还能解析回同一个地址
const PATH_ESCAPE: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'#').add(b'%').add(b'<').add(b'>').add(b'?');

/// 解析后的 AMQP URL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AmqpUrl {
    scheme: String,
    username: Option<String>,
    password: Option<String>,
    host: String,
    port: u16,
    path: String,
}

impl AmqpUrl {
    /// 解析地址字符串
    pub fn parse(input: &str) -> Result<Self, ContainerError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ContainerError::url_error(input, "empty address"));
        }

        let normalized = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("amqp://{}", trimmed)
        };

        let parsed = url::Url::parse(&normalized)
            .map_err(|e| ContainerError::url_error(input, e.to_string()))?;

        let scheme = parsed.scheme().to_ascii_lowercase();
        let port = match parsed.port() {
            Some(port) => port,
            None => Self::default_port(&scheme).ok_or_else(|| {
                ContainerError::url_error(input, format!("no default port for scheme '{}'", scheme))
            })?,
        };

        let host = match parsed.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => DEFAULT_HOST.to_string(),
        };

        let username = Some(parsed.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let password = parsed.password().map(str::to_string);
        // 节点地址不接受 query 和 fragment
        if parsed.query().is_some() || parsed.fragment().is_some() {
            return Err(ContainerError::url_error(input, "query and fragment are not allowed"));
        }
        let path = percent_decode_str(parsed.path().trim_start_matches('/'))
            .decode_utf8()
            .map_err(|e| ContainerError::url_error(input, e.to_string()))?
            .into_owned();

        Ok(Self {
            scheme,
            username,
            password,
            host,
            port,
            path,
        })
    }

    /// scheme 的缺省端口
    pub fn default_port(scheme: &str) -> Option<u16> {
        match scheme {
            "amqp" => Some(AMQP_PORT),
            "amqps" => Some(AMQPS_PORT),
            _ => None,
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// `amqps` 需要 TLS
    pub fn is_secure(&self) -> bool {
        self.scheme == "amqps"
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// 节点地址，没有 path 时为 `None`
    pub fn path(&self) -> Option<&str> {
        if self.path.is_empty() {
            None
        } else {
            Some(&self.path)
        }
    }
}

impl fmt::Display for AmqpUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if let Some(user) = &self.username {
            f.write_str(user)?;
            if let Some(password) = &self.password {
                write!(f, ":{}", password)?;
            }
            f.write_str("@")?;
        }
        write!(f, "{}:{}", self.host, self.port)?;
        if !self.path.is_empty() {
            write!(f, "/{}", utf8_percent_encode(&self.path, PATH_ESCAPE))?;
        }
        Ok(())
    }
}

impl FromStr for AmqpUrl {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AmqpUrl::parse(s)
    }
}

/// 候选地址列表，按轮询顺序给出下一个地址
#[derive(Debug, Clone)]
pub struct UrlList {
    urls: Vec<AmqpUrl>,
    cursor: usize,
}

impl UrlList {
    pub fn new(urls: Vec<AmqpUrl>) -> Result<Self, ContainerError> {
        if urls.is_empty() {
            return Err(ContainerError::config_error("urls", "address list is empty"));
        }
        Ok(Self { urls, cursor: 0 })
    }

    /// 从字符串列表解析
    pub fn parse<I, S>(values: I) -> Result<Self, ContainerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let urls = values
            .into_iter()
            .map(|v| AmqpUrl::parse(v.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(urls)
    }

    pub fn single(url: AmqpUrl) -> Self {
        Self {
            urls: vec![url],
            cursor: 0,
        }
    }

    /// 返回当前地址并前进，到末尾后回到第一个
    pub fn next(&mut self) -> &AmqpUrl {
        let index = self.cursor % self.urls.len();
        self.cursor = (index + 1) % self.urls.len();
        &self.urls[index]
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AmqpUrl> {
        self.urls.iter()
    }
}
