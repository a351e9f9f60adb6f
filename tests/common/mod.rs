//! 测试用反应器
//!
//! 按主机名脚本化连接结果：`Open` 在下一轮 `process` 报告对端打开，
//! `Refuse` 报告传输断开，`ConnectError` 让 `connect` 本身失败。
//! 测试通过 `ReactorProbe` 查看尝试记录并注入事件。

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use amqp_container::{
    AcceptorHandle, ConnectionHandle, Container, ContainerConfig, EngineError, MemoryEngine, Reactor, ReactorEvent,
    SharedEngine, TlsDomain, TransportTarget,
};

#[derive(Debug, Clone)]
pub enum HostBehaviour {
    Open,
    Refuse(String),
    ConnectError(String),
}

#[derive(Default)]
struct Shared {
    attempts: Mutex<Vec<(ConnectionHandle, TransportTarget)>>,
    script: Mutex<HashMap<String, HostBehaviour>>,
    injected: Mutex<VecDeque<ReactorEvent>>,
    listeners: Mutex<Vec<(String, u16, bool)>>,
    closed_acceptors: Mutex<Vec<AcceptorHandle>>,
    wakeups: AtomicUsize,
}

#[derive(Default)]
pub struct ScriptedReactor {
    shared: Arc<Shared>,
    pending: VecDeque<ReactorEvent>,
    next_acceptor: u64,
}

#[derive(Clone)]
pub struct ReactorProbe {
    shared: Arc<Shared>,
}

impl ScriptedReactor {
    pub fn new() -> (Self, ReactorProbe) {
        let reactor = Self::default();
        let probe = ReactorProbe {
            shared: reactor.shared.clone(),
        };
        (reactor, probe)
    }
}

impl ReactorProbe {
    pub fn script(&self, host: &str, behaviour: HostBehaviour) {
        self.shared.script.lock().insert(host.to_string(), behaviour);
    }

    /// 按顺序尝试过的主机
    pub fn attempted_hosts(&self) -> Vec<String> {
        self.shared
            .attempts
            .lock()
            .iter()
            .map(|(_, target)| target.host().to_string())
            .collect()
    }

    pub fn targets(&self) -> Vec<TransportTarget> {
        self.shared.attempts.lock().iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn inject(&self, event: ReactorEvent) {
        self.shared.injected.lock().push_back(event);
    }

    pub fn listeners(&self) -> Vec<(String, u16, bool)> {
        self.shared.listeners.lock().clone()
    }

    pub fn closed_acceptors(&self) -> Vec<AcceptorHandle> {
        self.shared.closed_acceptors.lock().clone()
    }

    pub fn wakeups(&self) -> usize {
        self.shared.wakeups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reactor for ScriptedReactor {
    async fn connect(&mut self, connection: ConnectionHandle, target: TransportTarget) -> Result<(), EngineError> {
        let behaviour = self
            .shared
            .script
            .lock()
            .get(target.host())
            .cloned()
            .unwrap_or(HostBehaviour::Open);
        self.shared.attempts.lock().push((connection, target));

        match behaviour {
            HostBehaviour::Open => self.pending.push_back(ReactorEvent::ConnectionRemoteOpen { connection }),
            HostBehaviour::Refuse(reason) => self.pending.push_back(ReactorEvent::TransportClosed {
                connection,
                error: Some(reason),
            }),
            HostBehaviour::ConnectError(reason) => return Err(EngineError::io(reason)),
        }
        Ok(())
    }

    async fn listen(&mut self, host: &str, port: u16, tls: Option<TlsDomain>) -> Result<AcceptorHandle, EngineError> {
        self.next_acceptor += 1;
        self.shared.listeners.lock().push((host.to_string(), port, tls.is_some()));
        Ok(AcceptorHandle::new(self.next_acceptor))
    }

    async fn close_acceptor(&mut self, acceptor: AcceptorHandle) -> Result<(), EngineError> {
        self.shared.closed_acceptors.lock().push(acceptor);
        Ok(())
    }

    async fn process(&mut self, timeout: Option<Duration>) -> Result<Vec<ReactorEvent>, EngineError> {
        let mut events: Vec<ReactorEvent> = self.pending.drain(..).collect();
        events.extend(self.shared.injected.lock().drain(..));
        if events.is_empty() {
            if let Some(timeout) = timeout {
                tokio::time::sleep(timeout.min(Duration::from_millis(200))).await;
            }
        }
        Ok(events)
    }

    fn wakeup(&self) {
        self.shared.wakeups.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub engine: Arc<Mutex<MemoryEngine>>,
    pub probe: ReactorProbe,
    pub container: Container,
}

pub fn harness(config: ContainerConfig) -> Harness {
    let engine = Arc::new(Mutex::new(MemoryEngine::new()));
    let shared: SharedEngine = engine.clone();
    let (reactor, probe) = ScriptedReactor::new();
    let container = Container::new(shared, reactor, config).expect("valid config");
    Harness {
        engine,
        probe,
        container,
    }
}

pub fn default_harness() -> Harness {
    harness(ContainerConfig::new().with_container_id("it"))
}

/// 安装测试日志输出，重复调用无害
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
