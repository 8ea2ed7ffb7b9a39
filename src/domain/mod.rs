//! Domain 模块
//!
//! 包含核心业务逻辑和领域模型

pub mod chain_event;
pub mod derivation_path;
pub mod payment;
pub mod seed_vault;

// 重新导出常用类型
pub use chain_event::{ChainEvent, ChainEventKind, EventSource};
pub use derivation_path::{AccountScope, AddressKind, DerivationPath, Network, PathError};
pub use payment::{
    normalize_address, Payment, PaymentAddress, PaymentRecord, PaymentState, StateTransition,
    TrackedTransaction, TransactionRecord,
};
pub use seed_vault::{KeyPair, MasterSeed, SeedVault, VaultError};
