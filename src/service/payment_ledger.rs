//! 支付账本
//!
//! 所有状态变更都经过 `update`，同一支付 ID 的读-改-写由独立的异步锁串行化，
//! 轮询和推送同时到达也不会交错。不同支付之间互不阻塞。
//!
//! 进程内的锁挡不住共享同一数据库的其他实例，写回时再以版本号做乐观检查，
//! 冲突后重新读取并重放变更。

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    domain::{normalize_address, payment::WATCHED_STATES, Payment, PaymentState},
    repository::{PaymentStore, StoreError},
    service::confirmation_state_machine::ConfirmationStateMachine,
};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("payment not found: {0}")]
    NotFound(Uuid),
    #[error("no payment for address {0}")]
    AddressNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LedgerError::NotFound(_)
                | LedgerError::AddressNotFound(_)
                | LedgerError::Store(StoreError::NotFound(_))
        )
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// 版本冲突后的最大重放次数
const MAX_UPDATE_ATTEMPTS: usize = 5;

type IdLock = Arc<tokio::sync::Mutex<()>>;

pub struct PaymentLedger {
    store: Arc<dyn PaymentStore>,
    locks: Mutex<HashMap<Uuid, IdLock>>,
}

impl PaymentLedger {
    pub fn new(store: Arc<dyn PaymentStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn PaymentStore> {
        &self.store
    }

    /// 记录新支付（初始状态 Awaiting）
    pub async fn record(&self, payment: &Payment) -> LedgerResult<()> {
        self.store.insert(payment).await?;
        tracing::info!(
            payment_id = %payment.id,
            address = %payment.address.address,
            path = %payment.address.path,
            expected_amount = payment.expected_amount,
            "Payment recorded"
        );
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> LedgerResult<Payment> {
        self.store
            .get(id)
            .await?
            .ok_or(LedgerError::NotFound(id))
    }

    /// 按地址查找；bech32 地址大小写不敏感
    pub async fn find_by_address(&self, address: &str) -> LedgerResult<Payment> {
        self.store
            .find_by_address(&normalize_address(address))
            .await?
            .ok_or_else(|| LedgerError::AddressNotFound(address.to_string()))
    }

    /// 原子更新单个支付
    ///
    /// 闭包在持有该支付锁期间执行，只有支付实际发生变化时才写回存储。
    /// 版本冲突时闭包会在最新记录上重新执行。返回更新后的支付和闭包的返回值。
    pub async fn update<F, R>(&self, id: Uuid, mutator: F) -> LedgerResult<(Payment, R)>
    where
        F: FnMut(&mut Payment) -> R + Send,
        R: Send,
    {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.read_modify_write(id, mutator).await
        };
        self.release(id, lock);
        result
    }

    async fn read_modify_write<F, R>(
        &self,
        id: Uuid,
        mut mutator: F,
    ) -> LedgerResult<(Payment, R)>
    where
        F: FnMut(&mut Payment) -> R + Send,
        R: Send,
    {
        let mut attempt = 1;
        loop {
            let mut payment = self.get(id).await?;
            let before = payment.clone();
            let out = mutator(&mut payment);
            if payment == before {
                return Ok((payment, out));
            }

            payment.version = before.version + 1;
            match self.store.put(&payment, before.version).await {
                Ok(()) => return Ok((payment, out)),
                Err(StoreError::Conflict(_)) if attempt < MAX_UPDATE_ATTEMPTS => {
                    tracing::warn!(
                        payment_id = %id,
                        attempt,
                        version = before.version,
                        "Payment changed by another writer, replaying update"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// 需要链上观察的支付（所有非终态）
    pub async fn list_awaiting(&self) -> LedgerResult<Vec<Payment>> {
        Ok(self.store.list_by_states(&WATCHED_STATES).await?)
    }

    /// 处理所有到期支付，返回进入终态的支付
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> LedgerResult<Vec<Payment>> {
        let overdue: Vec<Uuid> = self
            .list_awaiting()
            .await?
            .into_iter()
            .filter(|p| p.expires_at <= now)
            .map(|p| p.id)
            .collect();

        let mut finished = Vec::new();
        for id in overdue {
            let (payment, verdict) = self
                .update(id, |p| ConfirmationStateMachine::expire(p, now))
                .await?;
            if let Some(state) = verdict {
                tracing::info!(
                    payment_id = %payment.id,
                    state = %state,
                    observed_amount = payment.observed_amount,
                    "Payment reached deadline"
                );
                finished.push(payment);
            }
        }
        Ok(finished)
    }

    /// 各状态支付数量（用于健康检查）
    pub async fn count_by_state(&self, state: PaymentState) -> LedgerResult<usize> {
        Ok(self.store.list_by_states(&[state]).await?.len())
    }

    fn lock_for(&self, id: Uuid) -> IdLock {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(id).or_default().clone()
    }

    fn release(&self, id: Uuid, lock: IdLock) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // 只剩表内和当前持有者两个引用时才移除
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&id);
        }
    }
}
