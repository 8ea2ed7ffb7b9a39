//! 链上数据源
//!
//! 按地址查询余额和入账交易。默认实现对接 Esplora/Blockstream REST API：
//! - `GET /blocks/tip/height`
//! - `GET /address/{address}`
//! - `GET /address/{address}/txs`
//! - `GET /address/{address}/txs/chain/{last_seen_txid}`（已确认交易分页，每页 25 笔）

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;

use crate::metrics;

/// Esplora 每页返回的已确认交易数
const CHAIN_PAGE_SIZE: usize = 25;
/// 单次查询最多翻页数（含首页）
const MAX_CHAIN_PAGES: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum ChainQueryError {
    #[error("chain query timed out after {0:?}")]
    Timeout(Duration),
    #[error("chain source transport error: {0}")]
    Transport(String),
    #[error("chain source returned HTTP {0}")]
    Http(u16),
    #[error("unexpected chain source response: {0}")]
    Decode(String),
}

impl ChainQueryError {
    /// 是否值得重试
    pub fn is_transient(&self) -> bool {
        match self {
            ChainQueryError::Transport(_) => true,
            ChainQueryError::Http(status) => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// 单笔入账交易
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingTransaction {
    pub tx_hash: String,
    /// 支付到该地址的金额（最小单位）
    pub amount: u64,
    pub confirmations: u32,
}

/// 地址活动快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressActivity {
    pub confirmed_balance: u64,
    /// 未确认余额变化，可能为负（未确认的花费）
    pub unconfirmed_balance: i64,
    pub transactions: Vec<FundingTransaction>,
    /// 历史超出翻页上限，`transactions` 不完整
    pub truncated: bool,
}

#[async_trait]
pub trait ChainSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn address_activity(&self, address: &str) -> Result<AddressActivity, ChainQueryError>;
}

#[derive(Deserialize)]
struct TxoStats {
    funded_txo_sum: u64,
    spent_txo_sum: u64,
}

#[derive(Deserialize)]
struct AddressStats {
    chain_stats: TxoStats,
    mempool_stats: TxoStats,
}

#[derive(Deserialize)]
struct TxStatus {
    confirmed: bool,
    block_height: Option<u64>,
}

#[derive(Deserialize)]
struct TxOut {
    scriptpubkey_address: Option<String>,
    value: u64,
}

#[derive(Deserialize)]
struct EsploraTx {
    txid: String,
    vout: Vec<TxOut>,
    status: TxStatus,
}

/// Esplora REST 数据源
pub struct EsploraChainSource {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
}

impl EsploraChainSource {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<Self, ChainQueryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainQueryError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            max_retries: max_retries.max(1),
            retry_delay,
        })
    }

    async fn get_text(&self, path: &str) -> Result<String, ChainQueryError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ChainQueryError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChainQueryError::Http(status.as_u16()));
        }
        response
            .text()
            .await
            .map_err(|e| ChainQueryError::Transport(e.to_string()))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ChainQueryError> {
        let body = self.get_text(path).await?;
        serde_json::from_str(&body).map_err(|e| ChainQueryError::Decode(e.to_string()))
    }

    async fn fetch(&self, address: &str) -> Result<AddressActivity, ChainQueryError> {
        let tip: u64 = self
            .get_text("/blocks/tip/height")
            .await?
            .trim()
            .parse()
            .map_err(|e: std::num::ParseIntError| ChainQueryError::Decode(e.to_string()))?;

        let stats: AddressStats = self.get_json(&format!("/address/{}", address)).await?;
        let (txs, truncated) = self.fetch_history(address).await?;
        if truncated {
            tracing::warn!(
                address = %address,
                fetched = txs.len(),
                "Address history exceeds page limit, result is partial"
            );
        }

        Ok(AddressActivity {
            confirmed_balance: stats
                .chain_stats
                .funded_txo_sum
                .saturating_sub(stats.chain_stats.spent_txo_sum),
            unconfirmed_balance: stats.mempool_stats.funded_txo_sum as i64
                - stats.mempool_stats.spent_txo_sum as i64,
            transactions: funding_transactions(address, tip, &txs),
            truncated,
        })
    }

    /// 首页包含内存池交易和最新一页已确认交易，其后按最后一笔已确认 txid 翻页
    async fn fetch_history(&self, address: &str) -> Result<(Vec<EsploraTx>, bool), ChainQueryError> {
        let mut txs: Vec<EsploraTx> = self.get_json(&format!("/address/{}/txs", address)).await?;
        let mut cursor = next_chain_cursor(&txs);
        let mut pages = 1;

        while let Some(last_seen) = cursor {
            if pages >= MAX_CHAIN_PAGES {
                return Ok((txs, true));
            }
            let page: Vec<EsploraTx> = self
                .get_json(&format!("/address/{}/txs/chain/{}", address, last_seen))
                .await?;
            pages += 1;
            cursor = next_chain_cursor(&page);
            txs.extend(page);
        }

        Ok((txs, false))
    }
}

/// 页内已确认交易满一页时返回下一页的游标
fn next_chain_cursor(page: &[EsploraTx]) -> Option<String> {
    let confirmed: Vec<&EsploraTx> = page.iter().filter(|tx| tx.status.confirmed).collect();
    if confirmed.len() < CHAIN_PAGE_SIZE {
        return None;
    }
    confirmed.last().map(|tx| tx.txid.clone())
}

/// 从交易列表中提取支付到该地址的交易
fn funding_transactions(address: &str, tip: u64, txs: &[EsploraTx]) -> Vec<FundingTransaction> {
    txs.iter()
        .filter_map(|tx| {
            let amount: u64 = tx
                .vout
                .iter()
                .filter(|o| o.scriptpubkey_address.as_deref() == Some(address))
                .map(|o| o.value)
                .sum();
            if amount == 0 {
                return None;
            }
            let confirmations = match (tx.status.confirmed, tx.status.block_height) {
                (true, Some(height)) if tip >= height => {
                    u32::try_from(tip - height + 1).unwrap_or(u32::MAX)
                }
                _ => 0,
            };
            Some(FundingTransaction {
                tx_hash: tx.txid.to_ascii_lowercase(),
                amount,
                confirmations,
            })
        })
        .collect()
}

#[async_trait]
impl ChainSource for EsploraChainSource {
    fn name(&self) -> &'static str {
        "esplora"
    }

    async fn address_activity(&self, address: &str) -> Result<AddressActivity, ChainQueryError> {
        let mut last_err = ChainQueryError::Transport("no attempt made".into());

        for attempt in 1..=self.max_retries {
            let started = Instant::now();
            let result = match tokio::time::timeout(self.timeout, self.fetch(address)).await {
                Ok(r) => r,
                Err(_) => {
                    metrics::inc_chain_query_timeout();
                    // 超时视为本轮无新信息，不再重试
                    return Err(ChainQueryError::Timeout(self.timeout));
                }
            };
            metrics::observe_chain_query_ms(started.elapsed().as_millis(), result.is_ok());

            match result {
                Ok(activity) => return Ok(activity),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    tracing::warn!(attempt, error = %e, "Chain query failed, retrying");
                    tokio::time::sleep(self.retry_delay * attempt).await;
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err)
    }
}
