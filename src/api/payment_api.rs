//! 支付 API
//!
//! 创建支付（分配收款地址）、查询、按地址查询、派生核对。

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, rejection::PathRejection, Path, State},
    Json,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    api::response::{success_response, ApiResponse},
    app_state::AppState,
    domain::PaymentRecord,
    error::AppError,
    metrics,
    service::{payment_service::AddressVerification, NewPayment},
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreatePaymentReq {
    /// 应付金额（最小单位，必须为正）
    pub expected_amount: u64,
    /// BIP44 账户索引，默认 0
    pub account_index: Option<u32>,
    pub confirmations_required: Option<u32>,
    pub expires_in_secs: Option<u64>,
    /// 订单系统的外部引用
    pub order_ref: Option<String>,
}

impl From<CreatePaymentReq> for NewPayment {
    fn from(req: CreatePaymentReq) -> Self {
        NewPayment {
            expected_amount: req.expected_amount,
            account_index: req.account_index,
            confirmations_required: req.confirmations_required,
            expires_in_secs: req.expires_in_secs,
            order_ref: req.order_ref,
        }
    }
}

fn payment_id(path: Result<Path<Uuid>, PathRejection>) -> Result<Uuid, AppError> {
    path.map(|Path(id)| id)
        .map_err(|e| AppError::bad_request(format!("invalid payment id: {}", e.body_text())))
}

#[utoipa::path(
    post,
    path = "/api/v1/payments",
    request_body = CreatePaymentReq,
    responses(
        (status = 200, description = "Payment created, data is a PaymentRecord", body = PaymentRecord),
        (status = 400, description = "Validation failed", body = crate::error_body::ErrorBodyDoc),
        (status = 503, description = "Address space exhausted", body = crate::error_body::ErrorBodyDoc)
    )
)]
pub async fn create_payment(
    State(st): State<Arc<AppState>>,
    body: Result<Json<CreatePaymentReq>, JsonRejection>,
) -> Result<Json<ApiResponse<PaymentRecord>>, AppError> {
    let Json(req) = body.map_err(|e| {
        metrics::count_err("POST /api/v1/payments");
        AppError::validation_failed(e.body_text())
    })?;

    let payment = st.payments.create(req.into()).await.map_err(|e| {
        metrics::count_err("POST /api/v1/payments");
        AppError::from(e)
    })?;

    tracing::info!(
        payment_id = %payment.id,
        path = %payment.address.path,
        expected_amount = payment.expected_amount,
        expires_at = %payment.expires_at,
        "Payment created"
    );
    metrics::count_ok("POST /api/v1/payments");
    success_response(PaymentRecord::from(&payment))
}

#[utoipa::path(
    get,
    path = "/api/v1/payments/{id}",
    params(("id" = Uuid, Path, description = "Payment id")),
    responses(
        (status = 200, description = "Payment record", body = PaymentRecord),
        (status = 404, description = "Not found", body = crate::error_body::ErrorBodyDoc)
    )
)]
pub async fn get_payment(
    State(st): State<Arc<AppState>>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<ApiResponse<PaymentRecord>>, AppError> {
    let id = payment_id(path)?;
    let payment = st.payments.get(id).await?;
    metrics::count_ok("GET /api/v1/payments/:id");
    success_response(PaymentRecord::from(&payment))
}

#[utoipa::path(
    get,
    path = "/api/v1/payments/by-address/{address}",
    params(("address" = String, Path, description = "Payment address")),
    responses(
        (status = 200, description = "Payment record", body = PaymentRecord),
        (status = 404, description = "Not found", body = crate::error_body::ErrorBodyDoc)
    )
)]
pub async fn get_payment_by_address(
    State(st): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Json<ApiResponse<PaymentRecord>>, AppError> {
    let payment = st.payments.find_by_address(address.trim()).await?;
    metrics::count_ok("GET /api/v1/payments/by-address/:address");
    success_response(PaymentRecord::from(&payment))
}

#[utoipa::path(
    get,
    path = "/api/v1/payments/{id}/verify",
    params(("id" = Uuid, Path, description = "Payment id")),
    responses(
        (status = 200, description = "Re-derivation result", body = AddressVerification),
        (status = 404, description = "Not found", body = crate::error_body::ErrorBodyDoc)
    )
)]
pub async fn verify_payment_address(
    State(st): State<Arc<AppState>>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<ApiResponse<AddressVerification>>, AppError> {
    let id = payment_id(path)?;
    let report = st.payments.verify(id).await?;
    metrics::count_ok("GET /api/v1/payments/:id/verify");
    success_response(report)
}
