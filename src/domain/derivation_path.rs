//! BIP44/BIP84 派生路径
//!
//! 每个收款地址都记录完整派生路径，审计或恢复时只凭种子即可重新派生。
//! 约定：`m/purpose'/coin'/account'/chain/index`
//! - purpose: 84 = Native SegWit (P2WPKH)，44 = Legacy (P2PKH)
//! - coin: 0 = Mainnet，1 = Testnet
//! - chain: 0 = 收款链，1 = 找零链

use std::{fmt, str::FromStr};

use bitcoin::bip32::ChildNumber;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use utoipa::ToSchema;

/// 硬化派生偏移量
pub const HARDENED_OFFSET: u32 = 0x8000_0000;

/// 单层最大索引（非硬化空间 0..2^31）
pub const MAX_CHILD_INDEX: u32 = HARDENED_OFFSET - 1;

/// 收款链
pub const RECEIVE_CHAIN: u32 = 0;
/// 找零链
pub const CHANGE_CHAIN: u32 = 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("invalid derivation path: {0}")]
    InvalidFormat(String),
    #[error("child index {0} exceeds 2^31 - 1")]
    IndexOutOfRange(u32),
    #[error("hardened segment follows a non-hardened segment")]
    HardenedAfterSoft,
    #[error("path does not follow the purpose'/coin'/account'/chain/index convention: {0}")]
    Convention(String),
}

/// 网络
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    /// SLIP-44 coin type
    pub fn coin_type(&self) -> u32 {
        match self {
            Network::Mainnet => 0,
            Network::Testnet => 1,
        }
    }

    pub fn from_coin_type(coin_type: u32) -> Option<Self> {
        match coin_type {
            0 => Some(Network::Mainnet),
            1 => Some(Network::Testnet),
            _ => None,
        }
    }

    pub fn to_bitcoin(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }
}

impl FromStr for Network {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "bitcoin" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            other => Err(PathError::InvalidFormat(format!("unknown network: {}", other))),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 地址编码类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    /// P2WPKH (bc1q... / tb1q...)
    Witness,
    /// P2PKH (1... / m... / n...)
    Legacy,
}

impl AddressKind {
    /// BIP43 purpose 字段
    pub fn purpose(&self) -> u32 {
        match self {
            AddressKind::Witness => 84,
            AddressKind::Legacy => 44,
        }
    }

    pub fn from_purpose(purpose: u32) -> Option<Self> {
        match purpose {
            84 => Some(AddressKind::Witness),
            44 => Some(AddressKind::Legacy),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AddressKind::Witness => "witness",
            AddressKind::Legacy => "legacy",
        }
    }
}

impl FromStr for AddressKind {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "witness" | "segwit" | "p2wpkh" | "bech32" => Ok(AddressKind::Witness),
            "legacy" | "p2pkh" | "base58" => Ok(AddressKind::Legacy),
            other => Err(PathError::InvalidFormat(format!("unknown address kind: {}", other))),
        }
    }
}

/// 分配作用域：同一作用域内地址索引必须唯一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccountScope {
    pub network: Network,
    pub kind: AddressKind,
    pub account: u32,
}

impl fmt::Display for AccountScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "m/{}'/{}'/{}'",
            self.kind.purpose(),
            self.network.coin_type(),
            self.account
        )
    }
}

/// 路径段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathSegment {
    pub index: u32,
    pub hardened: bool,
}

impl PathSegment {
    pub fn hardened(index: u32) -> Self {
        Self {
            index,
            hardened: true,
        }
    }

    pub fn normal(index: u32) -> Self {
        Self {
            index,
            hardened: false,
        }
    }

    fn to_child_number(self) -> Result<ChildNumber, PathError> {
        let child = if self.hardened {
            ChildNumber::from_hardened_idx(self.index)
        } else {
            ChildNumber::from_normal_idx(self.index)
        };
        child.map_err(|_| PathError::IndexOutOfRange(self.index))
    }
}

/// 派生路径（有序的 (index, hardened) 序列）
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DerivationPath {
    segments: Vec<PathSegment>,
}

impl DerivationPath {
    pub fn new(segments: Vec<PathSegment>) -> Result<Self, PathError> {
        if let Some(bad) = segments.iter().find(|s| s.index > MAX_CHILD_INDEX) {
            return Err(PathError::IndexOutOfRange(bad.index));
        }
        Ok(Self { segments })
    }

    /// 构建收款地址路径：m/purpose'/coin'/account'/0/index
    pub fn receive(scope: AccountScope, address_index: u32) -> Result<Self, PathError> {
        Self::new(vec![
            PathSegment::hardened(scope.kind.purpose()),
            PathSegment::hardened(scope.network.coin_type()),
            PathSegment::hardened(scope.account),
            PathSegment::normal(RECEIVE_CHAIN),
            PathSegment::normal(address_index),
        ])
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// 转换为 bip32 子索引序列（全路径，私钥派生使用）
    pub fn to_child_numbers(&self) -> Result<Vec<ChildNumber>, PathError> {
        self.segments.iter().map(|s| s.to_child_number()).collect()
    }

    /// 拆分为硬化前缀和非硬化后缀
    ///
    /// 硬化前缀只能由私钥派生；后缀可以仅凭扩展公钥派生。
    /// 硬化段出现在非硬化段之后时无法进行公钥派生。
    pub fn split_hardened(&self) -> Result<(Vec<ChildNumber>, Vec<ChildNumber>), PathError> {
        let boundary = self
            .segments
            .iter()
            .position(|s| !s.hardened)
            .unwrap_or(self.segments.len());

        if self.segments[boundary..].iter().any(|s| s.hardened) {
            return Err(PathError::HardenedAfterSoft);
        }

        let prefix = self.segments[..boundary]
            .iter()
            .map(|s| s.to_child_number())
            .collect::<Result<Vec<_>, _>>()?;
        let suffix = self.segments[boundary..]
            .iter()
            .map(|s| s.to_child_number())
            .collect::<Result<Vec<_>, _>>()?;
        Ok((prefix, suffix))
    }

    /// 按约定解析路径，返回 (作用域, chain, address_index)
    pub fn convention(&self) -> Result<(AccountScope, u32, u32), PathError> {
        let [purpose, coin, account, chain, index] = self.segments.as_slice() else {
            return Err(PathError::Convention(format!(
                "expected 5 levels, got {}",
                self.segments.len()
            )));
        };

        if !(purpose.hardened && coin.hardened && account.hardened) {
            return Err(PathError::Convention(
                "purpose, coin and account must be hardened".into(),
            ));
        }
        if chain.hardened || index.hardened {
            return Err(PathError::Convention(
                "chain and address index must not be hardened".into(),
            ));
        }
        if chain.index != RECEIVE_CHAIN && chain.index != CHANGE_CHAIN {
            return Err(PathError::Convention(format!(
                "chain must be 0 or 1, got {}",
                chain.index
            )));
        }

        let kind = AddressKind::from_purpose(purpose.index).ok_or_else(|| {
            PathError::Convention(format!("unsupported purpose {}", purpose.index))
        })?;
        let network = Network::from_coin_type(coin.index).ok_or_else(|| {
            PathError::Convention(format!("unsupported coin type {}", coin.index))
        })?;

        Ok((
            AccountScope {
                network,
                kind,
                account: account.index,
            },
            chain.index,
            index.index,
        ))
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("m")?;
        for seg in &self.segments {
            if seg.hardened {
                write!(f, "/{}'", seg.index)?;
            } else {
                write!(f, "/{}", seg.index)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DerivationPath({})", self)
    }
}

impl FromStr for DerivationPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("m/")
            .ok_or_else(|| PathError::InvalidFormat("path must start with 'm/'".into()))?;

        let segments = rest
            .split('/')
            .map(|part| {
                let (digits, hardened) = match part.strip_suffix('\'') {
                    Some(d) => (d, true),
                    None => match part.strip_suffix('h') {
                        Some(d) => (d, true),
                        None => (part, false),
                    },
                };
                let index = digits
                    .parse::<u32>()
                    .map_err(|_| PathError::InvalidFormat(format!("bad segment '{}'", part)))?;
                Ok(PathSegment { index, hardened })
            })
            .collect::<Result<Vec<_>, PathError>>()?;

        Self::new(segments)
    }
}

impl Serialize for DerivationPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DerivationPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
