//! IronPay - HD 收款地址分配与链上确认跟踪
//!
//! 每笔支付从单一主种子派生独立收款地址，记录派生路径，
//! 通过轮询或推送观察链上交易，按金额和确认深度推进支付状态。

pub mod api;
pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod error_body;
pub mod infrastructure;
pub mod metrics;
pub mod repository;
pub mod service;

// 重新导出常用类型
pub use app_state::AppState;
pub use error::{AppError, AppErrorCode};

pub mod prelude {
    pub use crate::{
        app_state::AppState,
        domain::{
            AddressKind, ChainEvent, DerivationPath, MasterSeed, Network, Payment, PaymentState,
            SeedVault,
        },
        error::{AppError, AppErrorCode},
        service::{ChainObserver, PaymentLedger, PaymentService},
    };
}
