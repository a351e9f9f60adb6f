use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{engine::ConnectionHandle, event::ContainerEvent};

/// 容器事件流
///
/// 对广播事件的流式访问，可按连接过滤
pub struct ContainerEventStream {
    inner: BroadcastStream<ContainerEvent>,
    connection_filter: Option<ConnectionHandle>,
}

impl ContainerEventStream {
    pub fn new(receiver: broadcast::Receiver<ContainerEvent>) -> Self {
        Self {
            inner: BroadcastStream::new(receiver),
            connection_filter: None,
        }
    }

    /// 只保留某个连接的事件（没有连接归属的全局事件照常发出）
    pub fn filter_connection(mut self, connection: ConnectionHandle) -> Self {
        self.connection_filter = Some(connection);
        self
    }

    /// 获取下一个连接事件
    pub async fn next_connection_event(&mut self) -> Option<ContainerEvent> {
        self.next_matching(ContainerEvent::is_connection_event).await
    }

    /// 获取下一个错误事件
    pub async fn next_error_event(&mut self) -> Option<ContainerEvent> {
        self.next_matching(ContainerEvent::is_error_event).await
    }

    pub async fn next_transaction_event(&mut self) -> Option<ContainerEvent> {
        self.next_matching(ContainerEvent::is_transaction_event).await
    }

    async fn next_matching(&mut self, predicate: fn(&ContainerEvent) -> bool) -> Option<ContainerEvent> {
        while let Some(event) = self.next().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    }

    fn should_emit_event(&self, event: &ContainerEvent) -> bool {
        match (self.connection_filter, event.connection()) {
            (Some(filter), Some(connection)) => filter == connection,
            _ => true,
        }
    }
}

impl Stream for ContainerEventStream {
    type Item = ContainerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if self.should_emit_event(&event) {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(lagged))) => {
                    // 落后太多被丢弃的事件，继续读后面的
                    tracing::warn!("事件流落后: {}", lagged);
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_filter() {
        let (tx, rx) = broadcast::channel(16);
        let mut stream = ContainerEventStream::new(rx).filter_connection(ConnectionHandle::new(2));

        tx.send(ContainerEvent::TransactionAborted { connection: ConnectionHandle::new(1) }).unwrap();
        tx.send(ContainerEvent::TransactionAborted { connection: ConnectionHandle::new(2) }).unwrap();
        tx.send(ContainerEvent::ContainerClosed).unwrap();
        drop(tx);

        assert_eq!(
            stream.next().await,
            Some(ContainerEvent::TransactionAborted { connection: ConnectionHandle::new(2) })
        );
        assert_eq!(stream.next().await, Some(ContainerEvent::ContainerClosed));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_next_error_event_skips_others() {
        let (tx, rx) = broadcast::channel(16);
        let mut stream = ContainerEventStream::new(rx);
        let connection = ConnectionHandle::new(5);

        tx.send(ContainerEvent::ConnectionOpened { connection, connection_id: "c/1".into() }).unwrap();
        tx.send(ContainerEvent::TransportError { connection, error: "refused".into() }).unwrap();

        let event = stream.next_error_event().await;
        assert!(matches!(event, Some(ContainerEvent::TransportError { .. })));
    }
}
