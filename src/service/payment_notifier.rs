//! 终态通知
//!
//! 支付进入终态（confirmed / expired / failed / needs_review）时通知订单系统。
//! 通知由后台任务投递，失败只记录日志，不影响账本也不阻塞事件处理。

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    domain::{Payment, PaymentRecord, PaymentState},
    infrastructure::log_redact::redact_address,
    metrics,
    service::webhook_validator::compute_hmac_sha256,
};

const CALLBACK_MAX_RETRIES: u32 = 3;
const CALLBACK_RETRY_DELAY_MS: u64 = 500;

#[async_trait]
pub trait PaymentNotifier: Send + Sync {
    async fn notify(&self, payment: &Payment);
}

/// 结构化日志通知
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl PaymentNotifier for LogNotifier {
    async fn notify(&self, payment: &Payment) {
        match payment.state {
            PaymentState::NeedsReview => tracing::warn!(
                payment_id = %payment.id,
                address = %redact_address(&payment.address.address),
                observed_amount = payment.observed_amount,
                reason = payment.review_reason.as_deref().unwrap_or(""),
                "Payment needs manual review"
            ),
            state => tracing::info!(
                payment_id = %payment.id,
                address = %payment.address.address,
                state = %state,
                observed_amount = payment.observed_amount,
                expected_amount = payment.expected_amount,
                "Payment reached terminal state"
            ),
        }
    }
}

/// HTTP 回调通知（POST PaymentRecord JSON）
pub struct HttpCallbackNotifier {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl HttpCallbackNotifier {
    pub fn new(url: impl Into<String>, secret: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            secret: secret.filter(|s| !s.is_empty()),
        })
    }

    async fn post_once(&self, body: &[u8]) -> Result<(), String> {
        let mut request = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .body(body.to_vec());
        if let Some(secret) = &self.secret {
            request = request.header("x-webhook-signature", compute_hmac_sha256(secret, body));
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", response.status()))
        }
    }
}

#[async_trait]
impl PaymentNotifier for HttpCallbackNotifier {
    async fn notify(&self, payment: &Payment) {
        let body = match serde_json::to_vec(&PaymentRecord::from(payment)) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(payment_id = %payment.id, error = %e, "Failed to encode payment record");
                return;
            }
        };

        for attempt in 1..=CALLBACK_MAX_RETRIES {
            match self.post_once(&body).await {
                Ok(()) => {
                    tracing::info!(payment_id = %payment.id, state = %payment.state, "Payment callback delivered");
                    return;
                }
                Err(e) => {
                    tracing::warn!(payment_id = %payment.id, attempt, error = %e, "Payment callback failed");
                    if attempt < CALLBACK_MAX_RETRIES {
                        tokio::time::sleep(Duration::from_millis(
                            CALLBACK_RETRY_DELAY_MS * attempt as u64,
                        ))
                        .await;
                    }
                }
            }
        }
        tracing::error!(payment_id = %payment.id, "Payment callback abandoned after retries");
    }
}

/// 同时通知多个目标
pub struct FanoutNotifier {
    targets: Vec<Box<dyn PaymentNotifier>>,
}

impl FanoutNotifier {
    pub fn new(targets: Vec<Box<dyn PaymentNotifier>>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl PaymentNotifier for FanoutNotifier {
    async fn notify(&self, payment: &Payment) {
        for target in &self.targets {
            target.notify(payment).await;
        }
    }
}

/// 通知队列：调用方只负责入队，后台任务按顺序逐条投递
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::UnboundedSender<Payment>,
}

impl NotificationQueue {
    /// 启动投递任务；所有发送端释放后任务退出
    pub fn spawn(notifier: Arc<dyn PaymentNotifier>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Payment>();
        tokio::spawn(async move {
            while let Some(payment) = rx.recv().await {
                notifier.notify(&payment).await;
            }
            tracing::debug!("Notification worker stopped");
        });
        Self { tx }
    }

    pub fn enqueue(&self, payment: &Payment) {
        if self.tx.send(payment.clone()).is_err() {
            tracing::error!(
                payment_id = %payment.id,
                state = %payment.state,
                "Notification worker is gone, notification dropped"
            );
        }
    }
}

/// 状态变为终态时计数并入队通知（包括 Confirmed -> NeedsReview）
pub fn notify_if_finished(queue: &NotificationQueue, before: PaymentState, payment: &Payment) {
    if before != payment.state && payment.state.is_terminal() {
        metrics::inc_terminal(payment.state.as_str());
        queue.enqueue(payment);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{Duration as ChronoDuration, Utc};

    use super::*;
    use crate::domain::{AccountScope, AddressKind, DerivationPath, Network, PaymentAddress};

    #[derive(Default, Clone)]
    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl PaymentNotifier for Counting {
        async fn notify(&self, _payment: &Payment) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn payment(state: PaymentState) -> Payment {
        let now = Utc::now();
        let scope = AccountScope {
            network: Network::Testnet,
            kind: AddressKind::Witness,
            account: 0,
        };
        let mut p = Payment::new(
            PaymentAddress {
                path: DerivationPath::receive(scope, 0).unwrap(),
                address: "tb1qnotify".into(),
                network: Network::Testnet,
                kind: AddressKind::Witness,
                created_at: now,
            },
            1_000,
            1,
            now + ChronoDuration::minutes(5),
            None,
        );
        p.state = state;
        p
    }

    /// 每次投递都很慢的通知目标
    struct Slow {
        delivered: Arc<AtomicUsize>,
        delay: std::time::Duration,
    }

    #[async_trait]
    impl PaymentNotifier for Slow {
        async fn notify(&self, _payment: &Payment) {
            tokio::time::sleep(self.delay).await;
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn wait_for(counter: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("expected {} notifications, got {}", expected, counter.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_notifies_only_on_entering_terminal() {
        let counter = Counting::default();
        let fanout = FanoutNotifier::new(vec![Box::new(counter.clone()), Box::new(LogNotifier)]);
        let queue = NotificationQueue::spawn(Arc::new(fanout));

        notify_if_finished(&queue, PaymentState::Confirming, &payment(PaymentState::Confirmed));
        notify_if_finished(&queue, PaymentState::Confirmed, &payment(PaymentState::Confirmed));
        notify_if_finished(&queue, PaymentState::Awaiting, &payment(PaymentState::Detected));
        wait_for(&counter.0, 1).await;

        notify_if_finished(&queue, PaymentState::Confirmed, &payment(PaymentState::NeedsReview));
        wait_for(&counter.0, 2).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_slow_notifier_does_not_block_enqueue() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let queue = NotificationQueue::spawn(Arc::new(Slow {
            delivered: delivered.clone(),
            delay: std::time::Duration::from_millis(200),
        }));

        let started = std::time::Instant::now();
        for _ in 0..5 {
            notify_if_finished(&queue, PaymentState::Confirming, &payment(PaymentState::Confirmed));
        }
        assert!(started.elapsed() < std::time::Duration::from_millis(100));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);

        wait_for(&delivered, 5).await;
    }
}
