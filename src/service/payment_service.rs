//! 支付服务
//!
//! API 层使用的门面：分配地址并入账、查询、按派生路径重新派生做审计核对。

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    domain::{Network, Payment, SeedVault, VaultError},
    metrics,
    repository::StoreError,
    service::{
        address_allocator::{AddressAllocator, AllocationError},
        payment_ledger::{LedgerError, PaymentLedger},
    },
};

/// 地址唯一约束冲突时的最大重新分配次数
const MAX_INSERT_ATTEMPTS: usize = 5;
/// 单笔支付允许的最大确认数要求
pub const MAX_CONFIRMATIONS_REQUIRED: u32 = 1_000;
/// 单笔支付允许的最长有效期（一年）
pub const MAX_EXPIRES_IN_SECS: u64 = 365 * 24 * 3600;
/// 到期后等待确认的最长宽限期（三十天）
pub const MAX_CONFIRMATION_GRACE_SECS: u64 = 30 * 24 * 3600;

#[derive(Debug, thiserror::Error)]
pub enum PaymentServiceError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// 支付默认参数
#[derive(Debug, Clone)]
pub struct PaymentDefaults {
    pub network: Network,
    pub confirmations_required: u32,
    pub expires_in_secs: u64,
    /// 已足额但未达确认数的支付在到期后继续等待的秒数
    pub confirmation_grace_secs: u64,
}

/// 创建支付参数
#[derive(Debug, Clone, Default)]
pub struct NewPayment {
    pub expected_amount: u64,
    pub account_index: Option<u32>,
    pub confirmations_required: Option<u32>,
    pub expires_in_secs: Option<u64>,
    pub order_ref: Option<String>,
}

/// 地址核对结果
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AddressVerification {
    pub payment_id: Uuid,
    pub derivation_path: String,
    pub recorded_address: String,
    pub derived_address: String,
    pub matches: bool,
}

pub struct PaymentService {
    vault: Arc<SeedVault>,
    allocator: Arc<AddressAllocator>,
    ledger: Arc<PaymentLedger>,
    defaults: PaymentDefaults,
}

impl PaymentService {
    pub fn new(
        vault: Arc<SeedVault>,
        allocator: Arc<AddressAllocator>,
        ledger: Arc<PaymentLedger>,
        defaults: PaymentDefaults,
    ) -> Self {
        Self {
            vault,
            allocator,
            ledger,
            defaults,
        }
    }

    pub fn ledger(&self) -> &Arc<PaymentLedger> {
        &self.ledger
    }

    /// 创建支付：分配地址并记入账本
    ///
    /// 分配失败不会留下任何账本记录。
    pub async fn create(&self, req: NewPayment) -> Result<Payment, PaymentServiceError> {
        if req.expected_amount == 0 {
            return Err(PaymentServiceError::Validation(
                "expected_amount must be positive".into(),
            ));
        }
        let confirmations = req
            .confirmations_required
            .unwrap_or(self.defaults.confirmations_required);
        if !(1..=MAX_CONFIRMATIONS_REQUIRED).contains(&confirmations) {
            return Err(PaymentServiceError::Validation(format!(
                "confirmations_required must be between 1 and {}",
                MAX_CONFIRMATIONS_REQUIRED
            )));
        }
        let expires_in = req.expires_in_secs.unwrap_or(self.defaults.expires_in_secs);
        let expires_in = Some(expires_in)
            .filter(|s| (1..=MAX_EXPIRES_IN_SECS).contains(s))
            .and_then(|s| i64::try_from(s).ok())
            .and_then(Duration::try_seconds)
            .ok_or_else(|| {
                PaymentServiceError::Validation(format!(
                    "expires_in_secs must be between 1 and {}",
                    MAX_EXPIRES_IN_SECS
                ))
            })?;
        let grace = i64::try_from(self.defaults.confirmation_grace_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| {
                PaymentServiceError::Validation("confirmation_grace_secs out of range".into())
            })?;
        let account = req.account_index.unwrap_or(0);

        let mut last_err = None;
        for attempt in 1..=MAX_INSERT_ATTEMPTS {
            let address = match self.allocator.allocate(account, self.defaults.network).await {
                Ok(a) => a,
                Err(e) => {
                    metrics::inc_allocation(false);
                    tracing::error!(account, error = %e, "Address allocation failed");
                    return Err(e.into());
                }
            };

            let expires_at = match Utc::now().checked_add_signed(expires_in) {
                Some(at) => at,
                None => {
                    self.allocator.release(&address).await;
                    return Err(PaymentServiceError::Validation(
                        "expires_in_secs out of range".into(),
                    ));
                }
            };
            let payment = Payment::new(
                address,
                req.expected_amount,
                confirmations,
                expires_at,
                req.order_ref.clone(),
            )
            .with_confirmation_grace(grace);

            let recorded = self.ledger.record(&payment).await;
            self.allocator.release(&payment.address).await;
            match recorded {
                Ok(()) => {
                    metrics::inc_allocation(true);
                    return Ok(payment);
                }
                Err(LedgerError::Store(StoreError::Duplicate { field, value })) => {
                    // 其他进程抢先使用了该地址，重新分配
                    tracing::warn!(attempt, field, value = %value, "Allocated address already recorded, retrying");
                    last_err = Some(LedgerError::Store(StoreError::Duplicate { field, value }));
                }
                Err(e) => {
                    metrics::inc_allocation(false);
                    return Err(e.into());
                }
            }
        }

        metrics::inc_allocation(false);
        Err(last_err
            .map(PaymentServiceError::from)
            .unwrap_or_else(|| PaymentServiceError::Validation("allocation retries exhausted".into())))
    }

    pub async fn get(&self, id: Uuid) -> Result<Payment, PaymentServiceError> {
        Ok(self.ledger.get(id).await?)
    }

    pub async fn find_by_address(&self, address: &str) -> Result<Payment, PaymentServiceError> {
        Ok(self.ledger.find_by_address(address).await?)
    }

    /// 仅凭种子和记录的派生路径重新派生地址，核对是否一致
    pub async fn verify(&self, id: Uuid) -> Result<AddressVerification, PaymentServiceError> {
        let payment = self.ledger.get(id).await?;
        let recorded = &payment.address;
        let derived = self
            .vault
            .derive_address(&recorded.path, recorded.network, recorded.kind)?;

        let matches = derived == recorded.address;
        if !matches {
            tracing::error!(
                payment_id = %payment.id,
                path = %recorded.path,
                "Recorded address does not match re-derived address"
            );
        }

        Ok(AddressVerification {
            payment_id: payment.id,
            derivation_path: recorded.path.to_string(),
            recorded_address: recorded.address.clone(),
            derived_address: derived,
            matches,
        })
    }
}
