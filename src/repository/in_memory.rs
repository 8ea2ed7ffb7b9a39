use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{scope_and_index, PaymentStore, StoreError, StoreResult};
use crate::domain::{AccountScope, DerivationPath, Payment, PaymentState};

#[derive(Default)]
struct Inner {
    payments: HashMap<Uuid, Payment>,
    by_address: HashMap<String, Uuid>,
    by_path: HashMap<DerivationPath, Uuid>,
}

/// 线程安全的内存支付存储
///
/// 主表和两个唯一索引在同一把锁下维护，插入时的唯一性检查和写入是原子的。
#[derive(Default, Clone)]
pub struct InMemoryPaymentStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.payments.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn insert(&self, payment: &Payment) -> StoreResult<()> {
        let mut inner = self.inner.write().await;

        if inner.payments.contains_key(&payment.id) {
            return Err(StoreError::Duplicate {
                field: "id",
                value: payment.id.to_string(),
            });
        }
        if inner.by_address.contains_key(&payment.address.address) {
            return Err(StoreError::Duplicate {
                field: "address",
                value: payment.address.address.clone(),
            });
        }
        if inner.by_path.contains_key(&payment.address.path) {
            return Err(StoreError::Duplicate {
                field: "derivation_path",
                value: payment.address.path.to_string(),
            });
        }

        inner
            .by_address
            .insert(payment.address.address.clone(), payment.id);
        inner.by_path.insert(payment.address.path.clone(), payment.id);
        inner.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Payment>> {
        Ok(self.inner.read().await.payments.get(&id).cloned())
    }

    async fn find_by_address(&self, address: &str) -> StoreResult<Option<Payment>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_address
            .get(address)
            .and_then(|id| inner.payments.get(id))
            .cloned())
    }

    async fn find_by_path(&self, path: &DerivationPath) -> StoreResult<Option<Payment>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_path
            .get(path)
            .and_then(|id| inner.payments.get(id))
            .cloned())
    }

    async fn put(&self, payment: &Payment, expected_version: u64) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        match inner.payments.get_mut(&payment.id) {
            Some(existing) if existing.version != expected_version => {
                Err(StoreError::Conflict(payment.id))
            }
            Some(existing) => {
                *existing = payment.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(payment.id)),
        }
    }

    async fn list_by_states(&self, states: &[PaymentState]) -> StoreResult<Vec<Payment>> {
        let inner = self.inner.read().await;
        let mut payments: Vec<Payment> = inner
            .payments
            .values()
            .filter(|p| states.contains(&p.state))
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    async fn max_address_index(&self, scope: AccountScope) -> StoreResult<Option<u32>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_path
            .keys()
            .filter_map(scope_and_index)
            .filter(|(s, _)| *s == scope)
            .map(|(_, index)| index)
            .max())
    }
}
