//! 测试辅助模块
//! 提供固定助记词、可编排的链上数据源和完整服务装配

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use ironpay::{
    app_state::AppState,
    config::Config,
    domain::{AddressKind, MasterSeed, Network, Payment, PaymentState, SeedVault},
    repository::{InMemoryPaymentStore, PaymentStore},
    service::{
        AddressActivity, AllocationPolicy, ChainQueryError, ChainSource, FundingTransaction,
        PaymentNotifier,
    },
};

/// BIP39 标准测试向量
pub const FIXTURE_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

pub fn fixture_vault() -> Arc<SeedVault> {
    let seed = MasterSeed::from_mnemonic(FIXTURE_MNEMONIC, "").expect("fixture mnemonic is valid");
    Arc::new(SeedVault::new(seed))
}

/// 可编排的链上数据源：未设置的地址返回超时
#[derive(Default)]
pub struct MockChainSource {
    activity: Mutex<HashMap<String, AddressActivity>>,
    queries: Mutex<usize>,
}

impl MockChainSource {
    pub fn set(&self, address: &str, txs: &[(&str, u64, u32)]) {
        let transactions = txs
            .iter()
            .map(|(hash, amount, confirmations)| FundingTransaction {
                tx_hash: hash.to_string(),
                amount: *amount,
                confirmations: *confirmations,
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

    pub fn clear(&self, address: &str) {
        self.activity.lock().unwrap().remove(address);
    }

    pub fn queries(&self) -> usize {
        *self.queries.lock().unwrap()
    }
}

#[async_trait]
impl ChainSource for MockChainSource {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn address_activity(&self, address: &str) -> Result<AddressActivity, ChainQueryError> {
        *self.queries.lock().unwrap() += 1;
        self.activity
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or(ChainQueryError::Timeout(Duration::from_secs(1)))
    }
}

/// 记录终态通知
#[derive(Default)]
pub struct RecordingNotifier {
    pub seen: Mutex<Vec<(uuid::Uuid, PaymentState)>>,
}

impl RecordingNotifier {
    pub fn states(&self) -> Vec<PaymentState> {
        self.seen.lock().unwrap().iter().map(|(_, s)| *s).collect()
    }

    /// 通知在后台投递：等到至少收到 `count` 条，再稍等片刻让多余的通知也能到达
    pub async fn wait_for(&self, count: usize) -> Vec<PaymentState> {
        for _ in 0..200 {
            if self.seen.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.states()
    }
}

#[async_trait]
impl PaymentNotifier for RecordingNotifier {
    async fn notify(&self, payment: &Payment) {
        self.seen.lock().unwrap().push((payment.id, payment.state));
    }
}

/// 测试配置：测试网、P2WPKH、3 确认、15 分钟有效期、10 分钟确认宽限
pub fn test_config(policy: AllocationPolicy, webhook_secret: Option<&str>) -> Config {
    let mut config = Config::from_env().expect("config defaults");
    config.database.url = None;
    config.vault.allow_ephemeral_seed = true;
    config.payment.network = Network::Testnet;
    config.payment.address_kind = AddressKind::Witness;
    config.payment.allocation_policy = policy;
    config.payment.confirmations_required = 3;
    config.payment.expires_in_secs = 900;
    config.payment.confirmation_grace_secs = 600;
    config.chain.poll_interval_secs = 1;
    config.chain.poll_concurrency = 4;
    config.webhook.secret = webhook_secret.map(str::to_string);
    config.webhook.callback_url = None;
    config
}

/// 装配好的完整引擎
pub struct Engine {
    pub state: Arc<AppState>,
    pub store: Arc<InMemoryPaymentStore>,
    pub source: Arc<MockChainSource>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn engine() -> Engine {
    engine_with(AllocationPolicy::Sequential, None)
}

pub fn engine_with(policy: AllocationPolicy, webhook_secret: Option<&str>) -> Engine {
    engine_on_store(
        Arc::new(InMemoryPaymentStore::new()),
        policy,
        webhook_secret,
    )
}

/// 在已有存储上装配（模拟进程重启）
pub fn engine_on_store(
    store: Arc<InMemoryPaymentStore>,
    policy: AllocationPolicy,
    webhook_secret: Option<&str>,
) -> Engine {
    let source = Arc::new(MockChainSource::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let dyn_store: Arc<dyn PaymentStore> = store.clone();

    let state = Arc::new(AppState::new(
        Arc::new(test_config(policy, webhook_secret)),
        fixture_vault(),
        dyn_store,
        source.clone(),
        notifier.clone(),
        None,
    ));

    Engine {
        state,
        store,
        source,
        notifier,
    }
}
