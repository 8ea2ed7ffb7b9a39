//! 支付领域模型
//!
//! 一笔支付独占一个收款地址，地址不会跨订单复用。
//! 状态只能前进，唯一的回退是链重组导致的回滚。

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::domain::derivation_path::{AddressKind, DerivationPath, Network};

/// 支付状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    /// 地址已分配，尚未看到交易
    Awaiting,
    /// 交易出现在未确认池中（0 确认）
    Detected,
    /// 交易已打包，确认数累积中
    Confirming,
    /// 确认数和金额均满足要求（终态）
    Confirmed,
    /// 到期且从未收到资金（终态）
    Expired,
    /// 到期时条件仍未满足（终态）
    Failed,
    /// 已确认的支付被重组作废，需要人工介入（终态）
    NeedsReview,
}

/// 金额已满足但未达到确认深度时，到期后继续跟踪的默认宽限期
pub const DEFAULT_CONFIRMATION_GRACE_SECS: i64 = 24 * 3600;

/// 需要链上观察的状态
pub const WATCHED_STATES: [PaymentState; 3] = [
    PaymentState::Awaiting,
    PaymentState::Detected,
    PaymentState::Confirming,
];

impl PaymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Confirmed | Self::Expired | Self::Failed | Self::NeedsReview
        )
    }

    /// 正常推进路径上的下一个状态
    pub fn next_forward(&self) -> Option<Self> {
        match self {
            Self::Awaiting => Some(Self::Detected),
            Self::Detected => Some(Self::Confirming),
            Self::Confirming => Some(Self::Confirmed),
            _ => None,
        }
    }

    /// 推进路径上的序号，非推进路径状态返回 None
    pub fn progress_rank(&self) -> Option<u8> {
        match self {
            Self::Awaiting => Some(0),
            Self::Detected => Some(1),
            Self::Confirming => Some(2),
            Self::Confirmed => Some(3),
            _ => None,
        }
    }

    /// 验证状态转换合法性
    ///
    /// ```text
    /// Awaiting   -> Detected | Expired | Failed
    /// Detected   -> Confirming | Awaiting(重组) | Failed
    /// Confirming -> Confirmed | Detected(重组) | Awaiting(重组) | Failed
    /// Confirmed  -> NeedsReview(重组)
    /// ```
    pub fn can_transition_to(&self, target: &Self) -> bool {
        use PaymentState::*;

        match (self, target) {
            (Awaiting, Detected) | (Awaiting, Expired) | (Awaiting, Failed) => true,
            (Detected, Confirming) | (Detected, Awaiting) | (Detected, Failed) => true,
            (Confirming, Confirmed)
            | (Confirming, Detected)
            | (Confirming, Awaiting)
            | (Confirming, Failed) => true,
            (Confirmed, NeedsReview) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Awaiting => "awaiting",
            Self::Detected => "detected",
            Self::Confirming => "confirming",
            Self::Confirmed => "confirmed",
            Self::Expired => "expired",
            Self::Failed => "failed",
            Self::NeedsReview => "needs_review",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Awaiting => "等待付款",
            Self::Detected => "已发现交易",
            Self::Confirming => "确认中",
            Self::Confirmed => "已确认",
            Self::Expired => "已过期",
            Self::Failed => "支付失败",
            Self::NeedsReview => "需要人工复核",
        }
    }
}

impl std::str::FromStr for PaymentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "awaiting" => Ok(Self::Awaiting),
            "detected" => Ok(Self::Detected),
            "confirming" => Ok(Self::Confirming),
            "confirmed" => Ok(Self::Confirmed),
            "expired" => Ok(Self::Expired),
            "failed" => Ok(Self::Failed),
            "needs_review" => Ok(Self::NeedsReview),
            other => Err(format!("Invalid payment state: {}", other)),
        }
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 收款地址（创建后不可变）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAddress {
    pub path: DerivationPath,
    pub address: String,
    pub network: Network,
    pub kind: AddressKind,
    pub created_at: DateTime<Utc>,
}

/// 被跟踪的入账交易
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedTransaction {
    pub tx_hash: String,
    /// 支付到本地址的金额（最小单位）
    pub amount: u64,
    pub confirmations: u32,
    /// 交易已从所有观察到的池中消失
    pub dropped: bool,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 状态转换记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: PaymentState,
    pub to: PaymentState,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// 支付
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    /// 外部订单号
    pub order_ref: Option<String>,
    pub address: PaymentAddress,
    pub expected_amount: u64,
    pub state: PaymentState,
    pub observed_amount: u64,
    pub confirmations_required: u32,
    pub confirmations_seen: u32,
    pub expires_at: DateTime<Utc>,
    /// 确认截止时间：金额按时付清但深度不够时最多跟踪到此刻
    pub settle_by: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub transactions: Vec<TrackedTransaction>,
    /// 乐观并发版本号，每次写回加一
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub history: Vec<StateTransition>,
    #[serde(default)]
    pub review_reason: Option<String>,
}

impl Payment {
    pub fn new(
        address: PaymentAddress,
        expected_amount: u64,
        confirmations_required: u32,
        expires_at: DateTime<Utc>,
        order_ref: Option<String>,
    ) -> Self {
        let now = address.created_at;
        Self {
            id: Uuid::new_v4(),
            order_ref,
            address,
            expected_amount,
            state: PaymentState::Awaiting,
            observed_amount: 0,
            confirmations_required,
            confirmations_seen: 0,
            expires_at,
            settle_by: settle_deadline(expires_at, Duration::seconds(DEFAULT_CONFIRMATION_GRACE_SECS)),
            created_at: now,
            updated_at: now,
            transactions: Vec::new(),
            version: 0,
            history: Vec::new(),
            review_reason: None,
        }
    }

    /// 设置到期后的确认宽限期
    pub fn with_confirmation_grace(mut self, grace: Duration) -> Self {
        self.settle_by = settle_deadline(self.expires_at, grace);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// 仍被链认可的交易
    pub fn live_transactions(&self) -> impl Iterator<Item = &TrackedTransaction> {
        self.transactions.iter().filter(|tx| !tx.dropped)
    }

    pub fn transaction(&self, tx_hash: &str) -> Option<&TrackedTransaction> {
        self.transactions.iter().find(|tx| tx.tx_hash == tx_hash)
    }

    /// 是否曾经看到过（现已全部消失的）交易
    pub fn had_dropped_transactions(&self) -> bool {
        self.transactions.iter().any(|tx| tx.dropped)
    }

    pub fn record_transition(
        &mut self,
        to: PaymentState,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) {
        self.history.push(StateTransition {
            from: self.state,
            to,
            at,
            reason,
        });
        self.state = to;
        self.updated_at = at;
    }
}

fn settle_deadline(expires_at: DateTime<Utc>, grace: Duration) -> DateTime<Utc> {
    expires_at.checked_add_signed(grace).unwrap_or(expires_at)
}

/// 地址规范化：bech32 地址大小写不敏感，统一为小写；base58 地址区分大小写，原样保留
pub fn normalize_address(address: &str) -> String {
    let address = address.trim();
    let lower = address.to_ascii_lowercase();
    if ["bc1", "tb1", "bcrt1"].iter().any(|hrp| lower.starts_with(hrp)) {
        lower
    } else {
        address.to_string()
    }
}

/// 单笔交易导出格式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TransactionRecord {
    pub tx_hash: String,
    pub amount: u64,
    pub confirmations: u32,
    pub dropped: bool,
}

/// 支付导出格式（订单系统据此决定是否发货）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub order_ref: Option<String>,
    pub address: String,
    pub derivation_path: String,
    pub network: Network,
    pub expected_amount: u64,
    pub observed_amount: u64,
    pub state: PaymentState,
    pub confirmations_required: u32,
    pub confirmations_seen: u32,
    pub expires_at: DateTime<Utc>,
    pub settle_by: DateTime<Utc>,
    pub transactions: Vec<TransactionRecord>,
    pub review_reason: Option<String>,
}

impl From<&Payment> for PaymentRecord {
    fn from(p: &Payment) -> Self {
        Self {
            id: p.id,
            order_ref: p.order_ref.clone(),
            address: p.address.address.clone(),
            derivation_path: p.address.path.to_string(),
            network: p.address.network,
            expected_amount: p.expected_amount,
            observed_amount: p.observed_amount,
            state: p.state,
            confirmations_required: p.confirmations_required,
            confirmations_seen: p.confirmations_seen,
            expires_at: p.expires_at,
            settle_by: p.settle_by,
            transactions: p
                .transactions
                .iter()
                .map(|tx| TransactionRecord {
                    tx_hash: tx.tx_hash.clone(),
                    amount: tx.amount,
                    confirmations: tx.confirmations,
                    dropped: tx.dropped,
                })
                .collect(),
            review_reason: p.review_reason.clone(),
        }
    }
}
