//! 支付数据访问层
//!
//! `PaymentStore` 是账本的存储端口，内存实现用于测试和单机部署，
//! PostgreSQL 实现用于生产。两种实现都必须保证：
//! - 收款地址全局唯一
//! - 派生路径全局唯一

pub mod in_memory;
pub mod payment_repository;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{AccountScope, DerivationPath, Payment, PaymentState};

pub use in_memory::InMemoryPaymentStore;
pub use payment_repository::PgPaymentStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate {field}: {value}")]
    Duplicate { field: &'static str, value: String },
    #[error("payment not found: {0}")]
    NotFound(Uuid),
    #[error("payment {0} was modified concurrently")]
    Conflict(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt payment record: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// 插入新支付；地址、路径或 ID 已存在时返回 `Duplicate`
    async fn insert(&self, payment: &Payment) -> StoreResult<()>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<Payment>>;

    async fn find_by_address(&self, address: &str) -> StoreResult<Option<Payment>>;

    async fn find_by_path(&self, path: &DerivationPath) -> StoreResult<Option<Payment>>;

    /// 覆盖已有支付（地址和路径不可变）
    ///
    /// 仅当存储中的版本仍为 `expected_version` 时写入，否则返回 `Conflict`。
    async fn put(&self, payment: &Payment, expected_version: u64) -> StoreResult<()>;

    async fn list_by_states(&self, states: &[PaymentState]) -> StoreResult<Vec<Payment>>;

    /// 作用域内已分配的最大地址索引
    async fn max_address_index(&self, scope: AccountScope) -> StoreResult<Option<u32>>;
}

/// 从派生路径中取出 (作用域, 地址索引)，不符合约定的路径返回 None
pub(crate) fn scope_and_index(path: &DerivationPath) -> Option<(AccountScope, u32)> {
    path.convention().ok().map(|(scope, _, index)| (scope, index))
}
