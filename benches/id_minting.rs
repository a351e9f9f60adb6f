//! 标识生成基准测试
//!
//! 对比：
//! 1. IdFactory（单写者，无锁）与 ContainerId::next_id（互斥锁）
//! 2. ContainerId::next_id 在多线程竞争下的开销
//! 3. 附着缓存命中时的会话包装

use amqp_container::{
    ConnectionHandle, Container, ContainerConfig, ContainerId, IdFactory, MemoryEngine, ProtocolEngine, Reactor,
    ReactorEvent, SharedEngine,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;

fn bench_single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_thread_minting");
    group.throughput(Throughput::Elements(1));

    group.bench_function("id_factory_next", |b| {
        let mut ids = IdFactory::new("bench/1");
        b.iter(|| black_box(ids.next()));
    });

    group.bench_function("container_id_next_id", |b| {
        let id = ContainerId::new(Some("bench"));
        b.iter(|| black_box(id.next_id()));
    });

    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_minting");
    let threads = 4;
    let per_thread = 1_000;
    group.throughput(Throughput::Elements((threads * per_thread) as u64));

    group.bench_function("container_id_4_threads", |b| {
        let id = Arc::new(ContainerId::new(Some("bench")));
        b.iter(|| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let id = id.clone();
                    thread::spawn(move || {
                        for _ in 0..per_thread {
                            black_box(id.next_id());
                        }
                    })
                })
                .collect();
            for handle in handles {
                let _ = handle.join();
            }
        });
    });

    group.finish();
}

/// 什么都不做的反应器，只为构造容器
struct IdleReactor;

#[async_trait::async_trait]
impl Reactor for IdleReactor {
    async fn connect(
        &mut self,
        _connection: ConnectionHandle,
        _target: amqp_container::TransportTarget,
    ) -> Result<(), amqp_container::EngineError> {
        Ok(())
    }

    async fn listen(
        &mut self,
        _host: &str,
        _port: u16,
        _tls: Option<amqp_container::TlsDomain>,
    ) -> Result<amqp_container::AcceptorHandle, amqp_container::EngineError> {
        Ok(amqp_container::AcceptorHandle::new(0))
    }

    async fn close_acceptor(
        &mut self,
        _acceptor: amqp_container::AcceptorHandle,
    ) -> Result<(), amqp_container::EngineError> {
        Ok(())
    }

    async fn process(
        &mut self,
        _timeout: Option<std::time::Duration>,
    ) -> Result<Vec<ReactorEvent>, amqp_container::EngineError> {
        Ok(Vec::new())
    }

    fn wakeup(&self) {}
}

fn bench_wrap_session(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let engine = Arc::new(Mutex::new(MemoryEngine::new()));
    let shared: SharedEngine = engine.clone();
    let mut container = Container::new(shared, IdleReactor, ContainerConfig::new().with_container_id("bench")).unwrap();
    let connection = runtime
        .block_on(container.connect(amqp_container::ConnectOptions::address("amqp://localhost")))
        .unwrap();
    let session = connection.session().unwrap();
    let handle = session.handle();

    let mut group = c.benchmark_group("attachment_cache");
    group.bench_function("wrap_session_hit", |b| {
        b.iter(|| black_box(connection.wrap_session(handle)));
    });
    group.bench_function("session_state", |b| {
        b.iter(|| black_box(engine.lock().session_state(handle).unwrap()));
    });
    group.finish();
}

criterion_group!(benches, bench_single_thread, bench_contended, bench_wrap_session);
criterion_main!(benches);
