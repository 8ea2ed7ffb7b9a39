pub mod address_allocator;
pub mod chain_observer; // 轮询 + 推送统一入口
pub mod chain_source;
pub mod confirmation_state_machine;
pub mod payment_ledger;
pub mod payment_notifier;
pub mod payment_service;
pub mod reconciliation_policy;
pub mod webhook_validator;

pub use address_allocator::{AddressAllocator, AllocationError, AllocationPolicy};
pub use chain_observer::{ChainObserver, IngestOutcome, PollSummary};
pub use chain_source::{
    AddressActivity, ChainQueryError, ChainSource, EsploraChainSource, FundingTransaction,
};
pub use confirmation_state_machine::{ApplyOutcome, ConfirmationStateMachine};
pub use payment_ledger::{LedgerError, PaymentLedger};
pub use payment_notifier::{
    FanoutNotifier, HttpCallbackNotifier, LogNotifier, NotificationQueue, PaymentNotifier,
};
pub use payment_service::{NewPayment, PaymentDefaults, PaymentService, PaymentServiceError};
pub use webhook_validator::{ChainWebhookPayload, WebhookError, WebhookValidator};
