//! 地址分配器
//!
//! 为每笔支付派生一个全新的收款地址。同一作用域 `(network, kind, account)`
//! 的分配由异步互斥锁串行化；唯一性同时对照账本持久化的路径检查，
//! 进程重启后不会重复发放。

use std::{
    collections::{HashMap, HashSet},
    str::FromStr,
    sync::{Arc, Mutex},
};

use chrono::Utc;
use rand::{rngs::OsRng, Rng};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        derivation_path::MAX_CHILD_INDEX, AccountScope, AddressKind, DerivationPath, Network,
        PathError, PaymentAddress, SeedVault, VaultError,
    },
    repository::{PaymentStore, StoreError},
};

/// 随机策略的最大重抽次数
const RANDOM_MAX_ATTEMPTS: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("address index space exhausted for {0}")]
    AllocationExhausted(String),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 地址索引选择策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationPolicy {
    /// 单调递增游标
    #[default]
    Sequential,
    /// 随机索引 + 账本唯一性检查
    Random,
}

impl FromStr for AllocationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sequential" => Ok(AllocationPolicy::Sequential),
            "random" => Ok(AllocationPolicy::Random),
            other => Err(format!("unknown allocation policy: {}", other)),
        }
    }
}

#[derive(Default)]
struct ScopeCursor {
    /// None 表示尚未从账本加载
    next: Option<u64>,
    /// 随机策略下已发放但尚未写入账本的索引，入账后释放
    reserved: HashSet<u32>,
}

pub struct AddressAllocator {
    vault: Arc<SeedVault>,
    store: Arc<dyn PaymentStore>,
    policy: AllocationPolicy,
    kind: AddressKind,
    cursors: Mutex<HashMap<AccountScope, Arc<tokio::sync::Mutex<ScopeCursor>>>>,
}

impl AddressAllocator {
    pub fn new(
        vault: Arc<SeedVault>,
        store: Arc<dyn PaymentStore>,
        policy: AllocationPolicy,
        kind: AddressKind,
    ) -> Self {
        Self {
            vault,
            store,
            policy,
            kind,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> AllocationPolicy {
        self.policy
    }

    /// 为指定账户分配下一个收款地址
    pub async fn allocate(
        &self,
        account_index: u32,
        network: Network,
    ) -> Result<PaymentAddress, AllocationError> {
        if account_index > MAX_CHILD_INDEX {
            return Err(PathError::IndexOutOfRange(account_index).into());
        }
        let scope = AccountScope {
            network,
            kind: self.kind,
            account: account_index,
        };

        let slot = self.cursor_for(scope);
        let mut cursor = slot.lock().await;

        let index = match self.policy {
            AllocationPolicy::Sequential => self.next_sequential(scope, &mut cursor).await?,
            AllocationPolicy::Random => self.next_random(scope, &cursor).await?,
        };

        let path = DerivationPath::receive(scope, index)?;
        let address = self.vault.derive_address(&path, network, self.kind)?;
        // 顺序游标本身保证进程内不重复
        if self.policy == AllocationPolicy::Random {
            cursor.reserved.insert(index);
        }

        tracing::debug!(scope = %scope, index, address = %address, "Address allocated");

        Ok(PaymentAddress {
            path,
            address,
            network,
            kind: self.kind,
            created_at: Utc::now(),
        })
    }

    /// 入账结束（无论成功与否）后释放预留索引
    ///
    /// 成功时唯一性改由账本中的路径保证；失败时索引可以重新发放。
    pub async fn release(&self, address: &PaymentAddress) {
        let Ok((scope, _, index)) = address.path.convention() else {
            return;
        };
        let slot = self.cursor_for(scope);
        let mut cursor = slot.lock().await;
        cursor.reserved.remove(&index);
    }

    #[cfg(test)]
    async fn reserved_count(&self, scope: AccountScope) -> usize {
        self.cursor_for(scope).lock().await.reserved.len()
    }

    fn cursor_for(&self, scope: AccountScope) -> Arc<tokio::sync::Mutex<ScopeCursor>> {
        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        cursors.entry(scope).or_default().clone()
    }

    async fn next_sequential(
        &self,
        scope: AccountScope,
        cursor: &mut ScopeCursor,
    ) -> Result<u32, AllocationError> {
        let mut next = match cursor.next {
            Some(n) => n,
            None => self
                .store
                .max_address_index(scope)
                .await?
                .map(|max| u64::from(max) + 1)
                .unwrap_or(0),
        };

        loop {
            let index = u32::try_from(next)
                .ok()
                .filter(|i| *i <= MAX_CHILD_INDEX)
                .ok_or_else(|| AllocationError::AllocationExhausted(scope.to_string()))?;
            next += 1;

            // 其他进程可能已经占用该索引
            if self.is_taken(scope, index, cursor).await? {
                continue;
            }
            cursor.next = Some(next);
            return Ok(index);
        }
    }

    async fn next_random(
        &self,
        scope: AccountScope,
        cursor: &ScopeCursor,
    ) -> Result<u32, AllocationError> {
        for attempt in 0..RANDOM_MAX_ATTEMPTS {
            let index = OsRng.gen_range(0..=MAX_CHILD_INDEX);
            if !self.is_taken(scope, index, cursor).await? {
                return Ok(index);
            }
            tracing::warn!(scope = %scope, index, attempt, "Random address index collided, redrawing");
        }
        Err(AllocationError::AllocationExhausted(scope.to_string()))
    }

    async fn is_taken(
        &self,
        scope: AccountScope,
        index: u32,
        cursor: &ScopeCursor,
    ) -> Result<bool, AllocationError> {
        if cursor.reserved.contains(&index) {
            return Ok(true);
        }
        let path = DerivationPath::receive(scope, index)?;
        Ok(self.store.find_by_path(&path).await?.is_some())
    }
}
