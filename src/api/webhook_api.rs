//! 链上事件推送 API
//!
//! 索引服务推送 `{address, tx_hash, value, confirmations}`，
//! 与轮询路径进入同一个 `ChainObserver::ingest`。

use std::sync::Arc;

use axum::{body::Bytes, extract::State, http::HeaderMap, Extension, Json};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    api::{
        middleware::TraceId,
        response::{success_response, ApiResponse},
    },
    app_state::AppState,
    domain::PaymentState,
    error::AppError,
    metrics,
    service::{ApplyOutcome, ChainWebhookPayload, IngestOutcome},
};

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    /// "processed" 或 "ignored"（地址不属于任何支付）
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ApplyOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<PaymentState>,
}

#[utoipa::path(
    post,
    path = "/api/v1/webhooks/chain",
    request_body = ChainWebhookPayload,
    responses(
        (status = 200, description = "Event processed or ignored", body = WebhookAck),
        (status = 400, description = "Malformed payload", body = crate::error_body::ErrorBodyDoc),
        (status = 401, description = "Missing or invalid signature", body = crate::error_body::ErrorBodyDoc)
    )
)]
pub async fn chain_webhook(
    State(st): State<Arc<AppState>>,
    trace_id: Option<Extension<TraceId>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<WebhookAck>>, AppError> {
    let trace_id = trace_id.map(|Extension(TraceId(id))| id);
    let reject = |err: AppError| {
        metrics::inc_webhook_rejected();
        metrics::count_err("POST /api/v1/webhooks/chain");
        match &trace_id {
            Some(id) => err.with_trace_id(id.clone()),
            None => err,
        }
    };

    // 1. 签名（请求体原始字节）
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if let Err(e) = st.webhook.verify_signature(&body, signature) {
        tracing::warn!(error = %e, "Rejected chain webhook");
        return Err(reject(e.into()));
    }

    // 2. 载荷
    let payload = st.webhook.parse_payload(&body).map_err(|e| {
        tracing::warn!(error = %e, "Malformed chain webhook payload");
        reject(e.into())
    })?;

    // 3. 与轮询共用的入账路径
    let ack = match st.observer.ingest(payload.into_event()).await? {
        IngestOutcome::Ignored => WebhookAck {
            status: "ignored".into(),
            payment_id: None,
            outcome: None,
            state: None,
        },
        IngestOutcome::Processed { payment, outcome } => WebhookAck {
            status: "processed".into(),
            payment_id: Some(payment.id),
            outcome: Some(outcome),
            state: Some(payment.state),
        },
    };

    metrics::count_ok("POST /api/v1/webhooks/chain");
    success_response(ack)
}
