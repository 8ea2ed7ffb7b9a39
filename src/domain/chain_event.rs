//! 链上事件
//!
//! 轮询和推送两条路径产生同一种事件，由状态机统一消费。

use serde::{Deserialize, Serialize};

use crate::domain::payment::normalize_address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainEventKind {
    /// 交易出现（或确认数变化）
    Seen,
    /// 交易从所有观察到的池中消失
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Poll,
    Push,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Poll => "poll",
            EventSource::Push => "push",
        }
    }
}

/// 地址按 [`normalize_address`] 规范化，交易哈希统一为小写
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEvent {
    pub address: String,
    pub tx_hash: String,
    pub amount: u64,
    pub confirmations: u32,
    pub kind: ChainEventKind,
    pub source: EventSource,
}

impl ChainEvent {
    pub fn seen(
        address: impl Into<String>,
        tx_hash: impl Into<String>,
        amount: u64,
        confirmations: u32,
        source: EventSource,
    ) -> Self {
        let address: String = address.into();
        let tx_hash: String = tx_hash.into();
        Self {
            address: normalize_address(&address),
            tx_hash: tx_hash.to_ascii_lowercase(),
            amount,
            confirmations,
            kind: ChainEventKind::Seen,
            source,
        }
    }

    pub fn dropped(
        address: impl Into<String>,
        tx_hash: impl Into<String>,
        source: EventSource,
    ) -> Self {
        let address: String = address.into();
        let tx_hash: String = tx_hash.into();
        Self {
            address: normalize_address(&address),
            tx_hash: tx_hash.to_ascii_lowercase(),
            amount: 0,
            confirmations: 0,
            kind: ChainEventKind::Dropped,
            source,
        }
    }
}
