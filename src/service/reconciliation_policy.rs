//! 对账策略
//!
//! 决定金额不足/超额、多笔交易拼凑同一笔支付时如何计算金额和确认深度。

use chrono::{DateTime, Utc};

use crate::domain::{Payment, PaymentState, TrackedTransaction};

/// 金额对比结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmountStatus {
    Under,
    Exact,
    Over,
}

/// 对账结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// 所有有效交易金额之和
    pub observed_amount: u64,
    /// 达到期望金额所需交易中的最小确认数
    pub confirmations_seen: u32,
    pub amount: AmountStatus,
    pub has_live_tx: bool,
    pub has_mined_tx: bool,
}

impl Reconciliation {
    pub fn amount_met(&self) -> bool {
        self.amount != AmountStatus::Under
    }

    pub fn depth_met(&self, required: u32) -> bool {
        self.confirmations_seen >= required
    }

    pub fn is_final(&self, required: u32) -> bool {
        self.amount_met() && self.depth_met(required)
    }

    /// 推进路径上对应的状态
    pub fn progress_state(&self, required: u32) -> PaymentState {
        if self.is_final(required) {
            PaymentState::Confirmed
        } else if self.has_mined_tx {
            PaymentState::Confirming
        } else if self.has_live_tx {
            PaymentState::Detected
        } else {
            PaymentState::Awaiting
        }
    }
}

/// 对支付当前的交易集合进行对账
///
/// 确认深度的计算：按确认数从高到低累加有效交易金额，直到达到期望金额，
/// 取参与累加的交易中最小的确认数。未确认的补款交易只有在必须依赖它才能
/// 凑够金额时才会拉低深度。金额不足时取所有有效交易的最小确认数。
pub fn evaluate(payment: &Payment) -> Reconciliation {
    let mut live: Vec<&TrackedTransaction> = payment.live_transactions().collect();
    live.sort_by(|a, b| b.confirmations.cmp(&a.confirmations));

    let observed_amount = live
        .iter()
        .fold(0u64, |acc, tx| acc.saturating_add(tx.amount));

    let mut covered = 0u64;
    let mut depth = None;
    for tx in &live {
        covered = covered.saturating_add(tx.amount);
        depth = Some(tx.confirmations);
        if covered >= payment.expected_amount {
            break;
        }
    }

    let amount = match observed_amount.cmp(&payment.expected_amount) {
        std::cmp::Ordering::Less => AmountStatus::Under,
        std::cmp::Ordering::Equal => AmountStatus::Exact,
        std::cmp::Ordering::Greater => AmountStatus::Over,
    };

    Reconciliation {
        observed_amount,
        confirmations_seen: depth.unwrap_or(0),
        amount,
        has_live_tx: !live.is_empty(),
        has_mined_tx: live.iter().any(|tx| tx.confirmations > 0),
    }
}

/// 到期裁决
///
/// - 未到期或已是终态：None
/// - Awaiting 且从未看到交易：Expired
/// - Awaiting 但交易曾出现后消失：Failed
/// - Detected/Confirming 且金额不足：Failed
/// - 金额已满足但深度不够：继续跟踪到 `settle_by`，之后 Failed
pub fn expiry_verdict(payment: &Payment, now: DateTime<Utc>) -> Option<(PaymentState, &'static str)> {
    if payment.is_terminal() || now < payment.expires_at {
        return None;
    }

    match payment.state {
        PaymentState::Awaiting if payment.had_dropped_transactions() => Some((
            PaymentState::Failed,
            "funding transaction dropped and not replaced before expiry",
        )),
        PaymentState::Awaiting => Some((PaymentState::Expired, "no funds received before expiry")),
        PaymentState::Detected | PaymentState::Confirming => {
            if !evaluate(payment).amount_met() {
                Some((PaymentState::Failed, "underpaid at expiry"))
            } else if now >= payment.settle_by {
                Some((
                    PaymentState::Failed,
                    "not confirmed within the grace period after expiry",
                ))
            } else {
                None
            }
        }
        _ => None,
    }
}
