//! 本地事务
//!
//! 事务通过协调者链路（控制发送端）声明和结束。对端对控制投递的结算结果由容器
//! 转交给 `Transaction::handle_outcome`，再回调 `TransactionHandler`。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    engine::{
        DeliveryHandle, DeliveryState, LinkSetting, Outcome, RemoteOutcome, Terminus, TerminusKind,
        TransactionControl,
    },
    error::ContainerError,
    event::ContainerEvent,
    link::Sender,
    session::Session,
};

/// 控制发送端的链路名称
pub const TXN_CTL_NAME: &str = "txn-ctrl";
/// 协调者能力
pub const LOCAL_TRANSACTIONS: &str = "amqp:local-transactions";

/// 事务结果回调，所有方法默认什么都不做
pub trait TransactionHandler: Send + Sync {
    fn on_transaction_declared(&self, _transaction: &Transaction) {}

    fn on_transaction_declare_failed(&self, _transaction: &Transaction) {}

    fn on_transaction_committed(&self, _transaction: &Transaction) {}

    fn on_transaction_commit_failed(&self, _transaction: &Transaction) {}

    fn on_transaction_aborted(&self, _transaction: &Transaction) {}
}

/// 控制投递 -> 事务，供容器路由结算结果
pub(crate) type OutcomeRoutes = Arc<Mutex<HashMap<DeliveryHandle, Transaction>>>;

/// 在会话上打开协调者链路
pub(crate) fn open_txn_ctl(session: &Session) -> Result<Sender, ContainerError> {
    let sender = session.sender(TXN_CTL_NAME)?;
    sender.set_terminus_kind(Terminus::Target, TerminusKind::Coordinator)?;
    sender.apply(&LinkSetting::TargetCapability(LOCAL_TRANSACTIONS.to_string()))?;
    sender.open()?;
    tracing::debug!("打开事务控制链路 {}", sender.handle());
    Ok(sender)
}

#[derive(Debug, Default)]
struct TransactionState {
    id: Option<Bytes>,
    declare: Option<DeliveryHandle>,
    discharge: Option<DeliveryHandle>,
    failed: bool,
    pending: Vec<DeliveryHandle>,
}

struct TransactionInner {
    txn_ctl: Sender,
    handler: Option<Arc<dyn TransactionHandler>>,
    settle_before_discharge: bool,
    routes: OutcomeRoutes,
    state: Mutex<TransactionState>,
}

#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    /// 创建事务并立即发送 declare
    pub(crate) fn declare(
        txn_ctl: Sender,
        handler: Option<Arc<dyn TransactionHandler>>,
        settle_before_discharge: bool,
        routes: OutcomeRoutes,
    ) -> Result<Self, ContainerError> {
        let transaction = Self {
            inner: Arc::new(TransactionInner {
                txn_ctl,
                handler,
                settle_before_discharge,
                routes,
                state: Mutex::new(TransactionState::default()),
            }),
        };
        let delivery = transaction.send_ctrl(&TransactionControl::Declare)?;
        transaction.inner.state.lock().declare = Some(delivery);
        tracing::info!("声明事务 (delivery={})", delivery);
        Ok(transaction)
    }

    pub fn txn_ctl(&self) -> &Sender {
        &self.inner.txn_ctl
    }

    /// 协调者分配的事务ID，声明完成前为 `None`
    pub fn id(&self) -> Option<Bytes> {
        self.inner.state.lock().id.clone()
    }

    pub fn is_declared(&self) -> bool {
        self.inner.state.lock().id.is_some()
    }

    pub fn settle_before_discharge(&self) -> bool {
        self.inner.settle_before_discharge
    }

    /// 等待 discharge 时一并结算的投递
    pub fn pending(&self) -> Vec<DeliveryHandle> {
        self.inner.state.lock().pending.clone()
    }

    pub fn commit(&self) -> Result<(), ContainerError> {
        self.discharge(false)
    }

    pub fn abort(&self) -> Result<(), ContainerError> {
        self.discharge(true)
    }

    fn discharge(&self, fail: bool) -> Result<(), ContainerError> {
        let txn_id = {
            let mut state = self.inner.state.lock();
            state.failed = fail;
            state.id.clone()
        };
        let delivery = self.send_ctrl(&TransactionControl::Discharge { txn_id, fail })?;
        self.inner.state.lock().discharge = Some(delivery);
        tracing::info!("结束事务 fail={} (delivery={})", fail, delivery);
        Ok(())
    }

    fn send_ctrl(&self, control: &TransactionControl) -> Result<DeliveryHandle, ContainerError> {
        let delivery = {
            let mut engine = self.inner.txn_ctl.engine().lock();
            engine.send_control(self.inner.txn_ctl.handle(), control)?
        };
        self.inner.routes.lock().insert(delivery, self.clone());
        Ok(delivery)
    }

    fn txn_id_or_empty(&self) -> Bytes {
        self.id().unwrap_or_default()
    }

    /// 在事务内发送消息
    pub fn send(&self, sender: &Sender, payload: impl Into<Bytes>) -> Result<DeliveryHandle, ContainerError> {
        let delivery = sender.send(payload)?;
        let state = DeliveryState::Transactional {
            txn_id: self.txn_id_or_empty(),
            outcome: None,
        };
        sender.engine().lock().delivery_update(delivery, &state)?;
        Ok(delivery)
    }

    /// 在事务内接受一个收到的投递
    pub fn accept(&self, delivery: DeliveryHandle) -> Result<(), ContainerError> {
        self.update(delivery, Outcome::Accepted)?;
        if self.inner.settle_before_discharge {
            self.inner.txn_ctl.engine().lock().delivery_settle(delivery)?;
        } else {
            self.inner.state.lock().pending.push(delivery);
        }
        Ok(())
    }

    /// 给投递附加事务性结果
    pub fn update(&self, delivery: DeliveryHandle, outcome: Outcome) -> Result<(), ContainerError> {
        let state = DeliveryState::Transactional {
            txn_id: self.txn_id_or_empty(),
            outcome: Some(outcome),
        };
        self.inner.txn_ctl.engine().lock().delivery_update(delivery, &state)?;
        Ok(())
    }

    fn release_pending(&self) -> Result<(), ContainerError> {
        let pending = std::mem::take(&mut self.inner.state.lock().pending);
        let mut engine = self.inner.txn_ctl.engine().lock();
        for delivery in pending {
            engine.delivery_update(delivery, &DeliveryState::Outcome(Outcome::Released))?;
            engine.delivery_settle(delivery)?;
        }
        Ok(())
    }

    /// 处理控制投递的结算结果
    ///
    /// 返回要广播的事件；不属于本事务的投递返回 `None`。
    pub fn handle_outcome(
        &self,
        delivery: DeliveryHandle,
        outcome: &RemoteOutcome,
    ) -> Result<Option<ContainerEvent>, ContainerError> {
        let connection = self.inner.txn_ctl.connection_handle();
        let (is_declare, is_discharge, failed) = {
            let state = self.inner.state.lock();
            (
                state.declare == Some(delivery),
                state.discharge == Some(delivery),
                state.failed,
            )
        };

        if is_declare {
            if let RemoteOutcome::Declared { txn_id } = outcome {
                self.inner.state.lock().id = Some(txn_id.clone());
                tracing::info!("事务已声明: {:?}", txn_id);
                if let Some(handler) = &self.inner.handler {
                    handler.on_transaction_declared(self);
                }
                return Ok(Some(ContainerEvent::TransactionDeclared {
                    connection,
                    txn_id: txn_id.clone(),
                }));
            }
            if *outcome != RemoteOutcome::Rejected {
                tracing::warn!("declare 的意外结果: {:?}", outcome);
            }
            if let Some(handler) = &self.inner.handler {
                handler.on_transaction_declare_failed(self);
            }
            return Ok(Some(ContainerEvent::TransactionDeclareFailed { connection }));
        }

        if !is_discharge {
            return Ok(None);
        }

        let event = if *outcome == RemoteOutcome::Rejected {
            if failed {
                // abort 被拒绝，没有可以通知的结果
                tracing::warn!("abort 被协调者拒绝");
                None
            } else {
                tracing::warn!("事务提交失败");
                if let Some(handler) = &self.inner.handler {
                    handler.on_transaction_commit_failed(self);
                }
                self.release_pending()?;
                Some(ContainerEvent::TransactionCommitFailed { connection })
            }
        } else if failed {
            tracing::info!("事务已回滚");
            if let Some(handler) = &self.inner.handler {
                handler.on_transaction_aborted(self);
            }
            self.release_pending()?;
            Some(ContainerEvent::TransactionAborted { connection })
        } else {
            tracing::info!("事务已提交");
            if let Some(handler) = &self.inner.handler {
                handler.on_transaction_committed(self);
            }
            Some(ContainerEvent::TransactionCommitted { connection })
        };
        self.inner.state.lock().pending.clear();
        Ok(event)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Transaction")
            .field("txn_ctl", &self.inner.txn_ctl.handle())
            .field("id", &state.id)
            .field("failed", &state.failed)
            .field("pending", &state.pending.len())
            .finish()
    }
}
