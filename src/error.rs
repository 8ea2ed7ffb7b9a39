use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::{
    domain::VaultError,
    repository::StoreError,
    service::{AllocationError, LedgerError, PaymentServiceError, WebhookError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppErrorCode {
    // HTTP 基础错误码
    BadRequest,
    Unauthorized,
    NotFound,
    Internal,

    // 业务错误码
    PaymentNotFound,
    ValidationFailed,
    InvalidSignature,
    MalformedPayload,
    AllocationExhausted,
    DuplicateAddress,
    DerivationFailed,
    DatabaseError,
    ServiceUnavailable,
}

impl AppErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppErrorCode::BadRequest => "bad_request",
            AppErrorCode::Unauthorized => "unauthorized",
            AppErrorCode::NotFound => "not_found",
            AppErrorCode::Internal => "internal",

            AppErrorCode::PaymentNotFound => "payment_not_found",
            AppErrorCode::ValidationFailed => "validation_failed",
            AppErrorCode::InvalidSignature => "invalid_signature",
            AppErrorCode::MalformedPayload => "malformed_payload",
            AppErrorCode::AllocationExhausted => "allocation_exhausted",
            AppErrorCode::DuplicateAddress => "duplicate_address",
            AppErrorCode::DerivationFailed => "derivation_failed",
            AppErrorCode::DatabaseError => "database_error",
            AppErrorCode::ServiceUnavailable => "service_unavailable",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppError {
    pub code: AppErrorCode,
    pub message: String,
    pub status: StatusCode,
    pub trace_id: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
    trace_id: Option<&'a str>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code.as_str(),
            message: &self.message,
            trace_id: self.trace_id.as_deref(),
        };
        (self.status, Json(body)).into_response()
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl AppError {
    fn with(code: AppErrorCode, status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: msg.into(),
            status,
            trace_id: None,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::with(AppErrorCode::BadRequest, StatusCode::BAD_REQUEST, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::with(AppErrorCode::NotFound, StatusCode::NOT_FOUND, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::with(AppErrorCode::Internal, StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// 设置追踪ID
    pub fn with_trace_id(mut self, trace_id: String) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    // 业务错误辅助函数
    pub fn payment_not_found(msg: impl Into<String>) -> Self {
        Self::with(AppErrorCode::PaymentNotFound, StatusCode::NOT_FOUND, msg)
    }

    pub fn validation_failed(msg: impl Into<String>) -> Self {
        Self::with(AppErrorCode::ValidationFailed, StatusCode::BAD_REQUEST, msg)
    }

    /// 签名缺失或错误，不透露具体原因之外的信息
    pub fn invalid_signature(msg: impl Into<String>) -> Self {
        Self::with(AppErrorCode::InvalidSignature, StatusCode::UNAUTHORIZED, msg)
    }

    pub fn malformed_payload(msg: impl Into<String>) -> Self {
        Self::with(AppErrorCode::MalformedPayload, StatusCode::BAD_REQUEST, msg)
    }

    pub fn allocation_exhausted(msg: impl Into<String>) -> Self {
        Self::with(
            AppErrorCode::AllocationExhausted,
            StatusCode::SERVICE_UNAVAILABLE,
            msg,
        )
    }

    pub fn duplicate_address(msg: impl Into<String>) -> Self {
        Self::with(AppErrorCode::DuplicateAddress, StatusCode::CONFLICT, msg)
    }

    pub fn derivation_failed(msg: impl Into<String>) -> Self {
        Self::with(
            AppErrorCode::DerivationFailed,
            StatusCode::INTERNAL_SERVER_ERROR,
            msg,
        )
    }

    pub fn database_error(msg: impl Into<String>) -> Self {
        Self::with(
            AppErrorCode::DatabaseError,
            StatusCode::INTERNAL_SERVER_ERROR,
            msg,
        )
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::with(
            AppErrorCode::ServiceUnavailable,
            StatusCode::SERVICE_UNAVAILABLE,
            msg,
        )
    }
}

// 从 serde_json 错误转换
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::bad_request(format!("JSON serialization error: {}", err))
    }
}

// 从 UUID 错误转换
impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        Self::bad_request(format!("Invalid UUID: {}", err))
    }
}

// 从 anyhow 错误转换
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{}", err))
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::payment_not_found(format!("payment {} not found", id)),
            StoreError::Duplicate { field, value } => {
                Self::duplicate_address(format!("{} already recorded: {}", field, value))
            }
            StoreError::Conflict(id) => {
                tracing::warn!(payment_id = %id, "Payment update kept conflicting with another writer");
                Self::service_unavailable("payment is being updated, retry later")
            }
            StoreError::Database(e) => {
                tracing::error!(error = %e, "Payment store failure");
                Self::database_error("payment store unavailable")
            }
            StoreError::Serialization(e) => {
                tracing::error!(error = %e, "Payment record could not be decoded");
                Self::database_error("payment record corrupted")
            }
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(id) => Self::payment_not_found(format!("payment {} not found", id)),
            LedgerError::AddressNotFound(address) => {
                Self::payment_not_found(format!("no payment for address {}", address))
            }
            LedgerError::Store(e) => e.into(),
        }
    }
}

impl From<VaultError> for AppError {
    fn from(err: VaultError) -> Self {
        tracing::error!(error = %err, "Key derivation failed");
        Self::derivation_failed("key derivation failed")
    }
}

impl From<AllocationError> for AppError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::AllocationExhausted(scope) => {
                Self::allocation_exhausted(format!("no free address index left in {}", scope))
            }
            AllocationError::Vault(e) => e.into(),
            AllocationError::Path(e) => Self::validation_failed(e.to_string()),
            AllocationError::Store(e) => e.into(),
        }
    }
}

impl From<PaymentServiceError> for AppError {
    fn from(err: PaymentServiceError) -> Self {
        match err {
            PaymentServiceError::Validation(msg) => Self::validation_failed(msg),
            PaymentServiceError::Allocation(e) => e.into(),
            PaymentServiceError::Ledger(e) => e.into(),
            PaymentServiceError::Vault(e) => e.into(),
        }
    }
}

impl From<WebhookError> for AppError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::MissingSignature | WebhookError::InvalidSignature => {
                Self::invalid_signature(err.to_string())
            }
            WebhookError::Malformed(msg) => Self::malformed_payload(msg),
        }
    }
}
