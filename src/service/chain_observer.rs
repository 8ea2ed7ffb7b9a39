//! 链上观察服务
//!
//! 两种模式产生同一种 `ChainEvent`：
//! - 轮询：定期查询观察列表中每个地址的活动，与已记录的交易做差异
//! - 推送：Webhook 收到的事件经 `ingest` 进入同一条账本更新路径
//!
//! 数据源失败或超时只代表本轮没有新信息，不会让支付失败。

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::{stream, StreamExt};
use tokio::{sync::watch, time::interval};

use crate::{
    domain::{ChainEvent, EventSource, Payment},
    infrastructure::log_redact::redact_hex_string,
    metrics,
    service::{
        chain_source::{AddressActivity, ChainSource},
        confirmation_state_machine::{ApplyOutcome, ConfirmationStateMachine},
        payment_ledger::{LedgerError, PaymentLedger},
        payment_notifier::{notify_if_finished, NotificationQueue},
    },
};

/// 单个事件的处理结果
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// 地址不属于任何支付，已丢弃
    Ignored,
    Processed {
        payment: Box<Payment>,
        outcome: ApplyOutcome,
    },
}

/// 一轮轮询的统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub expired: usize,
    pub watched: usize,
    pub query_failures: usize,
    pub events_applied: usize,
}

pub struct ChainObserver {
    ledger: Arc<PaymentLedger>,
    source: Arc<dyn ChainSource>,
    notifications: NotificationQueue,
    poll_interval: Duration,
    concurrency: usize,
}

impl ChainObserver {
    pub fn new(
        ledger: Arc<PaymentLedger>,
        source: Arc<dyn ChainSource>,
        notifications: NotificationQueue,
        poll_interval: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            ledger,
            source,
            notifications,
            poll_interval,
            concurrency: concurrency.max(1),
        }
    }

    /// 处理一个链上事件（轮询和推送共用）
    pub async fn ingest(&self, event: ChainEvent) -> Result<IngestOutcome, LedgerError> {
        let payment = match self.ledger.find_by_address(&event.address).await {
            Ok(p) => p,
            Err(e) if e.is_not_found() => {
                metrics::inc_unknown_address();
                tracing::debug!(
                    source = event.source.as_str(),
                    tx_hash = %event.tx_hash,
                    "Dropping event for unknown address"
                );
                return Ok(IngestOutcome::Ignored);
            }
            Err(e) => return Err(e),
        };

        let (updated, (before, outcome)) = self
            .ledger
            .update(payment.id, |p| {
                let before = p.state;
                (before, ConfirmationStateMachine::apply(p, &event, Utc::now()))
            })
            .await?;

        metrics::inc_event(outcome.as_str());
        if before != updated.state {
            tracing::info!(
                payment_id = %updated.id,
                tx_hash = %event.tx_hash,
                source = event.source.as_str(),
                from = %before,
                to = %updated.state,
                observed_amount = updated.observed_amount,
                confirmations_seen = updated.confirmations_seen,
                "Payment state changed"
            );
        } else if outcome == ApplyOutcome::LateFunds {
            tracing::warn!(
                payment_id = %updated.id,
                tx_hash = %redact_hex_string(&event.tx_hash, 8),
                state = %updated.state,
                amount = event.amount,
                "Funds received after payment closed"
            );
        }

        notify_if_finished(&self.notifications, before, &updated);

        Ok(IngestOutcome::Processed {
            payment: Box::new(updated),
            outcome,
        })
    }

    /// 执行一轮轮询：先处理到期，再查询观察列表
    pub async fn poll_once(&self) -> Result<PollSummary, LedgerError> {
        let mut summary = PollSummary::default();

        for payment in self.ledger.expire_overdue(Utc::now()).await? {
            metrics::inc_terminal(payment.state.as_str());
            self.notifications.enqueue(&payment);
            summary.expired += 1;
        }

        let watch_list = self.ledger.list_awaiting().await?;
        summary.watched = watch_list.len();

        let source = self.source.clone();
        let results: Vec<_> = stream::iter(watch_list)
            .map(|payment| {
                let source = source.clone();
                async move {
                    let activity = source.address_activity(&payment.address.address).await;
                    (payment, activity)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (payment, activity) in results {
            let activity = match activity {
                Ok(a) => a,
                Err(e) => {
                    summary.query_failures += 1;
                    tracing::warn!(
                        payment_id = %payment.id,
                        source = source.name(),
                        error = %e,
                        "Chain query failed, no new information this cycle"
                    );
                    continue;
                }
            };

            for event in diff_activity(&payment, &activity) {
                match self.ingest(event).await {
                    Ok(IngestOutcome::Processed { outcome, .. }) if outcome != ApplyOutcome::Duplicate => {
                        summary.events_applied += 1;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(payment_id = %payment.id, error = %e, "Failed to apply chain event");
                    }
                }
            }
        }

        metrics::inc_poll_cycle();
        Ok(summary)
    }

    /// 启动后台轮询任务，收到关闭信号后退出
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.poll_interval);

        tracing::info!(
            source = self.source.name(),
            interval_secs = self.poll_interval.as_secs(),
            concurrency = self.concurrency,
            "Chain observer started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(summary) => {
                            if summary.events_applied > 0 || summary.expired > 0 {
                                tracing::info!(
                                    watched = summary.watched,
                                    applied = summary.events_applied,
                                    expired = summary.expired,
                                    failures = summary.query_failures,
                                    "Poll cycle finished"
                                );
                            }
                        }
                        Err(e) => tracing::error!(error = ?e, "Poll cycle failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Chain observer stopped");
    }
}

/// 把一次查询结果转换为事件：上报的交易为 Seen，已跟踪但未出现的为 Dropped
///
/// 数据源返回的交易列表不完整时（`truncated`），缺失不能说明交易被移除，
/// 此时只产生 Seen。
pub fn diff_activity(payment: &Payment, activity: &AddressActivity) -> Vec<ChainEvent> {
    let address = &payment.address.address;

    let mut events: Vec<ChainEvent> = activity
        .transactions
        .iter()
        .map(|tx| {
            ChainEvent::seen(
                address.clone(),
                tx.tx_hash.clone(),
                tx.amount,
                tx.confirmations,
                EventSource::Poll,
            )
        })
        .collect();

    if activity.truncated {
        tracing::debug!(
            payment_id = %payment.id,
            reported = activity.transactions.len(),
            "Address history truncated, skipping drop detection"
        );
        return events;
    }

    events.extend(
        payment
            .live_transactions()
            .filter(|tracked| {
                !activity
                    .transactions
                    .iter()
                    .any(|tx| tx.tx_hash == tracked.tx_hash)
            })
            .map(|tracked| ChainEvent::dropped(address.clone(), tracked.tx_hash.clone(), EventSource::Poll)),
    );

    events
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::{
        domain::{
            AccountScope, AddressKind, ChainEventKind, DerivationPath, Network, PaymentAddress,
            PaymentState,
        },
        repository::InMemoryPaymentStore,
        service::{
            chain_source::{ChainQueryError, FundingTransaction},
            payment_notifier::LogNotifier,
        },
    };

    #[derive(Default)]
    struct ScriptedSource {
        activity: Mutex<HashMap<String, AddressActivity>>,
    }

    impl ScriptedSource {
        fn set(&self, address: &str, txs: Vec<(&str, u64, u32)>) {
            let transactions = txs
                .into_iter()
                .map(|(hash, amount, confirmations)| FundingTransaction {
                    tx_hash: hash.to_string(),
                    amount,
                    confirmations,
                })
                .collect();
            self.activity.lock().unwrap().insert(
                address.to_string(),
                AddressActivity {
                    transactions,
                    ..Default::default()
                },
            );
        }
    }

    #[async_trait]
    impl ChainSource for ScriptedSource {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn address_activity(&self, address: &str) -> Result<AddressActivity, ChainQueryError> {
            self.activity
                .lock()
                .unwrap()
                .get(address)
                .cloned()
                .ok_or(ChainQueryError::Timeout(std::time::Duration::from_secs(1)))
        }
    }

    fn payment(index: u32, expected: u64) -> Payment {
        let now = Utc::now();
        let scope = AccountScope {
            network: Network::Testnet,
            kind: AddressKind::Witness,
            account: 0,
        };
        Payment::new(
            PaymentAddress {
                path: DerivationPath::receive(scope, index).unwrap(),
                address: format!("tb1qobserver{}", index),
                network: Network::Testnet,
                kind: AddressKind::Witness,
                created_at: now,
            },
            expected,
            2,
            now + ChronoDuration::hours(1),
            None,
        )
    }

    async fn observer() -> (ChainObserver, Arc<ScriptedSource>, Arc<PaymentLedger>) {
        let ledger = Arc::new(PaymentLedger::new(Arc::new(InMemoryPaymentStore::new())));
        let source = Arc::new(ScriptedSource::default());
        let observer = ChainObserver::new(
            ledger.clone(),
            source.clone(),
            NotificationQueue::spawn(Arc::new(LogNotifier)),
            Duration::from_secs(60),
            4,
        );
        (observer, source, ledger)
    }

    #[test]
    fn test_diff_reports_missing_as_dropped() {
        let mut p = payment(0, 1_000);
        let address = p.address.address.clone();
        ConfirmationStateMachine::apply(
            &mut p,
            &ChainEvent::seen(address, "old", 1_000, 1, EventSource::Push),
            Utc::now(),
        );

        let activity = AddressActivity {
            transactions: vec![FundingTransaction {
                tx_hash: "new".into(),
                amount: 500,
                confirmations: 0,
            }],
            ..Default::default()
        };
        let events = diff_activity(&p, &activity);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ChainEventKind::Seen);
        assert_eq!(events[1].kind, ChainEventKind::Dropped);
        assert_eq!(events[1].tx_hash, "old");
    }

    #[test]
    fn test_truncated_history_never_reports_drops() {
        let mut p = payment(0, 1_000);
        let address = p.address.address.clone();
        ConfirmationStateMachine::apply(
            &mut p,
            &ChainEvent::seen(address, "old", 1_000, 1, EventSource::Push),
            Utc::now(),
        );

        // 只拿到了最近的一页历史，已跟踪的交易不在其中
        let activity = AddressActivity {
            transactions: vec![FundingTransaction {
                tx_hash: "new".into(),
                amount: 500,
                confirmations: 0,
            }],
            truncated: true,
            ..Default::default()
        };
        let events = diff_activity(&p, &activity);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChainEventKind::Seen);
        assert_eq!(events[0].tx_hash, "new");
    }

    #[tokio::test]
    async fn test_poll_cycle_drives_payment_to_confirmed() {
        let (observer, source, ledger) = observer().await;
        let p = payment(0, 50_000);
        ledger.record(&p).await.unwrap();

        source.set(&p.address.address, vec![("aa", 50_000, 0)]);
        let summary = observer.poll_once().await.unwrap();
        assert_eq!(summary.watched, 1);
        assert_eq!(summary.events_applied, 1);
        assert_eq!(ledger.get(p.id).await.unwrap().state, PaymentState::Detected);

        // 同样的数据再轮询一次不产生变化
        let summary = observer.poll_once().await.unwrap();
        assert_eq!(summary.events_applied, 0);

        source.set(&p.address.address, vec![("aa", 50_000, 2)]);
        observer.poll_once().await.unwrap();
        let done = ledger.get(p.id).await.unwrap();
        assert_eq!(done.state, PaymentState::Confirmed);
        assert_eq!(done.observed_amount, 50_000);

        // 终态后不再观察
        assert_eq!(observer.poll_once().await.unwrap().watched, 0);
    }

    #[tokio::test]
    async fn test_query_failure_is_not_payment_failure() {
        let (observer, _source, ledger) = observer().await;
        let p = payment(1, 10_000);
        ledger.record(&p).await.unwrap();

        let summary = observer.poll_once().await.unwrap();
        assert_eq!(summary.query_failures, 1);
        assert_eq!(ledger.get(p.id).await.unwrap().state, PaymentState::Awaiting);
    }

    #[tokio::test]
    async fn test_unknown_address_is_ignored() {
        let (observer, _source, _ledger) = observer().await;
        let outcome = observer
            .ingest(ChainEvent::seen("tb1qnobody", "ff", 1, 0, EventSource::Push))
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Ignored));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (observer, _source, _ledger) = observer().await;
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::new(observer).run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
