//! 确认状态机
//!
//! 纯函数：输入 (支付, 链上事件, 当前时间)，原地修改支付并返回处理结果。
//! 不做任何 I/O，原子性由账本的 `update` 保证。
//!
//! ```text
//! Awaiting -> Detected -> Confirming -> Confirmed
//!     |           |            |            |
//!  Expired      Failed       Failed     NeedsReview (重组)
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    domain::{ChainEvent, ChainEventKind, EventSource, Payment, PaymentState, TrackedTransaction},
    service::reconciliation_policy,
};

/// 事件处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// 事件改变了支付
    Applied,
    /// 重复事件，无任何变化
    Duplicate,
    /// 支付已过期/失败，资金已记录但状态不变
    LateFunds,
    /// 支付处于人工复核，交易已记录但状态冻结
    Frozen,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied => "applied",
            ApplyOutcome::Duplicate => "duplicate",
            ApplyOutcome::LateFunds => "late_funds",
            ApplyOutcome::Frozen => "frozen",
        }
    }
}

pub struct ConfirmationStateMachine;

impl ConfirmationStateMachine {
    /// 消费一个链上事件
    pub fn apply(payment: &mut Payment, event: &ChainEvent, now: DateTime<Utc>) -> ApplyOutcome {
        // 到期判定优先于新事件
        Self::expire(payment, now);

        if !record_transaction(payment, event, now) {
            return ApplyOutcome::Duplicate;
        }
        payment.updated_at = now;

        match payment.state {
            PaymentState::NeedsReview => ApplyOutcome::Frozen,
            PaymentState::Expired | PaymentState::Failed => {
                payment.observed_amount = reconciliation_policy::evaluate(payment).observed_amount;
                ApplyOutcome::LateFunds
            }
            _ => {
                Self::reconcile(payment, now);
                ApplyOutcome::Applied
            }
        }
    }

    /// 到期处理，返回新的终态（如有）
    pub fn expire(payment: &mut Payment, now: DateTime<Utc>) -> Option<PaymentState> {
        let (target, reason) = reconciliation_policy::expiry_verdict(payment, now)?;
        payment.record_transition(target, now, Some(reason.to_string()));
        Some(target)
    }

    fn reconcile(payment: &mut Payment, now: DateTime<Utc>) {
        let eval = reconciliation_policy::evaluate(payment);
        payment.observed_amount = eval.observed_amount;

        let required = payment.confirmations_required;
        let target = eval.progress_state(required);

        if payment.state == PaymentState::Confirmed {
            if target != PaymentState::Confirmed {
                // 下游可能已据此发货，不能静默回退
                payment.confirmations_seen = eval.confirmations_seen;
                let reason = format!(
                    "confirmed payment invalidated: observed {} of {}, depth {} of {}",
                    eval.observed_amount, payment.expected_amount, eval.confirmations_seen, required
                );
                payment.review_reason = Some(reason.clone());
                payment.record_transition(PaymentState::NeedsReview, now, Some(reason));
            } else {
                payment.confirmations_seen = eval.confirmations_seen;
            }
            return;
        }

        payment.confirmations_seen = eval.confirmations_seen;
        walk_to(payment, target, now);
    }
}

/// 沿推进路径逐步移动到目标状态；目标在当前之前视为重组回滚
fn walk_to(payment: &mut Payment, target: PaymentState, now: DateTime<Utc>) {
    let (Some(current_rank), Some(target_rank)) =
        (payment.state.progress_rank(), target.progress_rank())
    else {
        return;
    };

    if target_rank < current_rank {
        if payment.state.can_transition_to(&target) {
            payment.record_transition(target, now, Some("reorg rollback".to_string()));
        }
        return;
    }

    while payment.state != target {
        let Some(next) = payment.state.next_forward() else {
            break;
        };
        let reason = match next {
            PaymentState::Detected => "transaction seen in mempool",
            PaymentState::Confirming => "transaction included in a block",
            _ => "confirmation threshold reached",
        };
        payment.record_transition(next, now, Some(reason.to_string()));
    }
}

/// 把事件记入交易列表，返回是否有变化
fn record_transaction(payment: &mut Payment, event: &ChainEvent, now: DateTime<Utc>) -> bool {
    let existing = payment
        .transactions
        .iter_mut()
        .find(|tx| tx.tx_hash == event.tx_hash);

    match (event.kind, existing) {
        (ChainEventKind::Seen, None) => {
            payment.transactions.push(TrackedTransaction {
                tx_hash: event.tx_hash.clone(),
                amount: event.amount,
                confirmations: event.confirmations,
                dropped: false,
                first_seen_at: now,
                updated_at: now,
            });
            true
        }
        (ChainEventKind::Seen, Some(tx)) => {
            if tx.amount != event.amount {
                tracing::warn!(
                    payment_id = %payment.id,
                    tx_hash = %event.tx_hash,
                    recorded = tx.amount,
                    reported = event.amount,
                    "Transaction amount changed between reports, keeping first value"
                );
            }
            if !tx.dropped && tx.confirmations == event.confirmations {
                return false;
            }
            // 推送可能重投或乱序到达，只有轮询快照和显式 dropped 才算重组证据
            if !tx.dropped
                && event.source == EventSource::Push
                && event.confirmations < tx.confirmations
            {
                tracing::debug!(
                    payment_id = %payment.id,
                    tx_hash = %event.tx_hash,
                    recorded = tx.confirmations,
                    reported = event.confirmations,
                    "Ignoring stale pushed confirmation count"
                );
                return false;
            }
            if event.confirmations < tx.confirmations {
                tracing::warn!(
                    payment_id = %payment.id,
                    tx_hash = %event.tx_hash,
                    from = tx.confirmations,
                    to = event.confirmations,
                    "Confirmation count decreased, treating as reorg"
                );
            }
            tx.dropped = false;
            tx.confirmations = event.confirmations;
            tx.updated_at = now;
            true
        }
        (ChainEventKind::Dropped, Some(tx)) if !tx.dropped => {
            tx.dropped = true;
            tx.confirmations = 0;
            tx.updated_at = now;
            true
        }
        (ChainEventKind::Dropped, _) => false,
    }
}
