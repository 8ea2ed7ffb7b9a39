use std::{sync::Arc, time::Duration};

use crate::{
    config::Config,
    domain::SeedVault,
    infrastructure::db::PgPool,
    repository::PaymentStore,
    service::{
        AddressAllocator, ChainObserver, ChainSource, FanoutNotifier, HttpCallbackNotifier,
        LogNotifier, NotificationQueue, PaymentLedger, PaymentNotifier, PaymentService,
        WebhookValidator,
    },
};

/// 应用状态
/// 包含所有共享资源
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub vault: Arc<SeedVault>,
    pub ledger: Arc<PaymentLedger>,
    pub allocator: Arc<AddressAllocator>,
    pub payments: Arc<PaymentService>,
    pub observer: Arc<ChainObserver>,
    pub webhook: Arc<WebhookValidator>,
    /// 使用内存账本时为 None
    pub pool: Option<PgPool>,
}

impl AppState {
    /// 组装服务：金库、账本、分配器、观察者共享同一个存储
    ///
    /// 需要在 tokio 运行时内调用（会启动通知投递任务）。
    pub fn new(
        config: Arc<Config>,
        vault: Arc<SeedVault>,
        store: Arc<dyn PaymentStore>,
        source: Arc<dyn ChainSource>,
        notifier: Arc<dyn PaymentNotifier>,
        pool: Option<PgPool>,
    ) -> Self {
        let ledger = Arc::new(PaymentLedger::new(store.clone()));
        let allocator = Arc::new(AddressAllocator::new(
            vault.clone(),
            store,
            config.payment.allocation_policy,
            config.payment.address_kind,
        ));
        let payments = Arc::new(PaymentService::new(
            vault.clone(),
            allocator.clone(),
            ledger.clone(),
            config.payment.defaults(),
        ));
        let observer = Arc::new(ChainObserver::new(
            ledger.clone(),
            source,
            NotificationQueue::spawn(notifier),
            config.chain.poll_interval(),
            config.chain.poll_concurrency,
        ));
        let webhook = Arc::new(WebhookValidator::new(config.webhook.secret.clone()));

        Self {
            config,
            vault,
            ledger,
            allocator,
            payments,
            observer,
            webhook,
            pool,
        }
    }

    /// 按配置构造终态通知：总是写日志，配置了回调地址时再 POST
    pub fn build_notifier(config: &Config) -> anyhow::Result<Arc<dyn PaymentNotifier>> {
        let Some(url) = config.webhook.callback_url.clone() else {
            return Ok(Arc::new(LogNotifier));
        };

        let callback = HttpCallbackNotifier::new(
            url,
            config.webhook.secret.clone(),
            Duration::from_secs(config.webhook.callback_timeout_secs),
        )?;
        tracing::info!("Payment callback notifier enabled");

        Ok(Arc::new(FanoutNotifier::new(vec![
            Box::new(LogNotifier),
            Box::new(callback),
        ])))
    }
}
