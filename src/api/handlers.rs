use std::sync::Arc;

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    api::response::success_response, app_state::AppState, domain::PaymentState, error::AppError,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct Healthz {
    pub status: String,
    /// "postgres" 或 "memory"
    pub store: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_ok: Option<bool>,
    pub network: String,
    pub webhook_signing: bool,
    /// 等待人工复核的支付数
    pub needs_review: usize,
    pub version: String,
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "OK", body = Healthz))
)]
pub async fn healthz(
    State(st): State<Arc<AppState>>,
) -> Result<Json<crate::api::response::ApiResponse<Healthz>>, AppError> {
    let db_ok = match &st.pool {
        Some(pool) => Some(crate::infrastructure::db::health_check(pool).await.is_ok()),
        None => None,
    };
    let status = if db_ok == Some(false) {
        "degraded".into()
    } else {
        "ok".into()
    };
    let needs_review = st.ledger.count_by_state(PaymentState::NeedsReview).await?;
    let version = format!(
        "{}+{}",
        env!("CARGO_PKG_VERSION"),
        option_env!("GIT_HASH").unwrap_or("dev")
    );

    success_response(Healthz {
        status,
        store: if st.pool.is_some() { "postgres" } else { "memory" }.into(),
        db_ok,
        network: st.config.payment.network.to_string(),
        webhook_signing: st.webhook.is_enabled(),
        needs_review,
        version,
    })
}

/// Prometheus 文本格式指标
pub async fn metrics() -> Response {
    let mut resp = crate::metrics::render_prometheus().into_response();
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    resp
}
