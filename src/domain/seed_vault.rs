//! 种子保管库
//!
//! 持有主种子并对外只提供派生能力：
//! - 主种子、私钥材料只存在于内存，随保管库一起销毁（zeroize）
//! - 硬化路径段只能由私钥派生，非硬化路径段由扩展公钥派生
//! - 地址派生只返回地址，不返回私钥

use std::fmt;

use bip39::{Language, Mnemonic};
use bitcoin::{
    bip32::{Xpriv, Xpub},
    secp256k1::{self, All, Secp256k1, SecretKey},
    Address, PublicKey,
};
use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::domain::derivation_path::{
    AccountScope, AddressKind, DerivationPath, Network, PathError, PathSegment,
};

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("insufficient entropy: platform RNG unavailable ({0})")]
    InsufficientEntropy(String),
    #[error("entropy must be 128..=256 bits in steps of 32, got {0}")]
    InvalidEntropyLength(usize),
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("key derivation failed: {0}")]
    Derivation(String),
    #[error("address encoding failed: {0}")]
    Address(String),
}

/// 主种子（BIP39 种子，64 字节）
///
/// 不实现 Clone / Serialize，Debug 输出已脱敏。
pub struct MasterSeed {
    bytes: Zeroizing<[u8; 64]>,
}

impl MasterSeed {
    /// 使用操作系统随机源生成新种子
    ///
    /// 返回种子和助记词；助记词只用于一次性离线备份，调用方不得写入日志。
    pub fn generate(entropy_bits: usize) -> Result<(Self, Zeroizing<String>), VaultError> {
        Self::generate_with(&mut OsRng, entropy_bits)
    }

    /// 使用指定随机源生成新种子
    pub fn generate_with<R: RngCore + ?Sized>(
        rng: &mut R,
        entropy_bits: usize,
    ) -> Result<(Self, Zeroizing<String>), VaultError> {
        if !(128..=256).contains(&entropy_bits) || entropy_bits % 32 != 0 {
            return Err(VaultError::InvalidEntropyLength(entropy_bits));
        }

        let mut entropy = Zeroizing::new(vec![0u8; entropy_bits / 8]);
        rng.try_fill_bytes(entropy.as_mut_slice())
            .map_err(|e| VaultError::InsufficientEntropy(e.to_string()))?;

        let mnemonic = Mnemonic::from_entropy_in(Language::English, entropy.as_slice())
            .map_err(|e| VaultError::InvalidMnemonic(e.to_string()))?;
        let phrase = Zeroizing::new(mnemonic.to_string());
        let seed = Self::from_mnemonic(&phrase, "")?;

        Ok((seed, phrase))
    }

    /// 从助记词恢复种子（BIP39 校验和验证）
    pub fn from_mnemonic(phrase: &str, passphrase: &str) -> Result<Self, VaultError> {
        let mnemonic = Mnemonic::parse_in(Language::English, phrase)
            .map_err(|e| VaultError::InvalidMnemonic(e.to_string()))?;

        Ok(Self {
            bytes: Zeroizing::new(mnemonic.to_seed(passphrase)),
        })
    }
}

impl fmt::Debug for MasterSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSeed(***)")
    }
}

/// 派生出的密钥对
///
/// 私钥字段不对外暴露；比较时对私钥做常量时间比较。
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    fn from_secret(secp: &Secp256k1<All>, secret: SecretKey) -> Self {
        let public = PublicKey::new(secp256k1::PublicKey::from_secret_key(secp, &secret));
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// 压缩公钥 (hex)
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.to_bytes())
    }

    pub fn address(&self, network: Network, kind: AddressKind) -> Result<String, VaultError> {
        encode_address(&self.public, network, kind)
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        let a = Zeroizing::new(self.secret.secret_bytes());
        let b = Zeroizing::new(other.secret.secret_bytes());
        bool::from(a[..].ct_eq(&b[..])) && self.public == other.public
    }
}

impl Eq for KeyPair {}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key_hex())
            .field("secret", &"***")
            .finish()
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
    }
}

/// 种子保管库
///
/// 派生函数是纯函数，不修改任何共享状态，可在多个任务中并发调用（`Arc<SeedVault>`）。
pub struct SeedVault {
    seed: MasterSeed,
    secp: Secp256k1<All>,
}

impl SeedVault {
    pub fn new(seed: MasterSeed) -> Self {
        Self {
            seed,
            secp: Secp256k1::new(),
        }
    }

    fn master(&self, network: Network) -> Result<Xpriv, VaultError> {
        Xpriv::new_master(network.to_bitcoin(), &self.seed.bytes[..])
            .map_err(|e| VaultError::Derivation(e.to_string()))
    }

    /// 按完整路径派生密钥对（私钥派生）
    pub fn derive_key_pair(&self, path: &DerivationPath) -> Result<KeyPair, VaultError> {
        let children = path.to_child_numbers()?;
        // 网络只影响扩展密钥的序列化前缀，不影响派生结果
        let xpriv = self
            .master(Network::Mainnet)?
            .derive_priv(&self.secp, &children)
            .map_err(|e| VaultError::Derivation(e.to_string()))?;

        Ok(KeyPair::from_secret(&self.secp, xpriv.private_key))
    }

    /// 派生收款地址
    ///
    /// 硬化前缀由私钥派生，转换为扩展公钥后再派生非硬化后缀，
    /// 返回值只包含地址。
    pub fn derive_address(
        &self,
        path: &DerivationPath,
        network: Network,
        kind: AddressKind,
    ) -> Result<String, VaultError> {
        let (hardened, soft) = path.split_hardened()?;

        let parent_xpriv = self
            .master(network)?
            .derive_priv(&self.secp, &hardened)
            .map_err(|e| VaultError::Derivation(e.to_string()))?;
        let parent_xpub = Xpub::from_priv(&self.secp, &parent_xpriv);

        let child = parent_xpub
            .derive_pub(&self.secp, &soft)
            .map_err(|e| VaultError::Derivation(e.to_string()))?;

        encode_address(&PublicKey::new(child.public_key), network, kind)
    }

    /// 账户级扩展公钥（仅公钥材料，可用于只读审计）
    pub fn account_xpub(&self, scope: AccountScope) -> Result<String, VaultError> {
        let path = DerivationPath::new(vec![
            PathSegment::hardened(scope.kind.purpose()),
            PathSegment::hardened(scope.network.coin_type()),
            PathSegment::hardened(scope.account),
        ])?;
        let xpriv = self
            .master(scope.network)?
            .derive_priv(&self.secp, &path.to_child_numbers()?)
            .map_err(|e| VaultError::Derivation(e.to_string()))?;

        Ok(Xpub::from_priv(&self.secp, &xpriv).to_string())
    }
}

impl fmt::Debug for SeedVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeedVault").field("seed", &self.seed).finish()
    }
}

fn encode_address(
    public: &PublicKey,
    network: Network,
    kind: AddressKind,
) -> Result<String, VaultError> {
    match kind {
        AddressKind::Witness => Address::p2wpkh(public, network.to_bitcoin())
            .map(|a| a.to_string())
            .map_err(|e| VaultError::Address(e.to_string())),
        AddressKind::Legacy => Ok(Address::p2pkh(public, network.to_bitcoin()).to_string()),
    }
}
