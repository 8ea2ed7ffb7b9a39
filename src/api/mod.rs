use std::{sync::Arc, time::Instant};

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::from_fn,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::Level;
use utoipa::OpenApi;

use crate::{
    api::middleware::{trace_id_middleware, TraceId},
    app_state::AppState,
};

pub mod account_api;
pub mod handlers;
pub mod middleware;
pub mod payment_api;
pub mod response; // 统一响应格式
pub mod webhook_api;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "IronPay API",
        description = "HD payment-address allocation and confirmation tracking"
    ),
    paths(
        payment_api::create_payment,
        payment_api::get_payment,
        payment_api::get_payment_by_address,
        payment_api::verify_payment_address,
        account_api::get_account_xpub,
        webhook_api::chain_webhook,
        handlers::healthz,
    ),
    components(
        schemas(
            payment_api::CreatePaymentReq,
            webhook_api::WebhookAck,
            account_api::AccountXpub,
            handlers::Healthz,
            crate::domain::PaymentRecord,
            crate::domain::TransactionRecord,
            crate::domain::PaymentState,
            crate::domain::Network,
            crate::service::ApplyOutcome,
            crate::service::ChainWebhookPayload,
            crate::service::payment_service::AddressVerification,
            crate::error_body::ErrorBodyDoc,
        )
    ),
    tags(
        (name = "IronPay API", description = "Auto-generated OpenAPI via utoipa")
    )
)]
pub struct ApiDoc;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        // 支付
        .route("/api/v1/payments", post(payment_api::create_payment))
        .route("/api/v1/payments/:id", get(payment_api::get_payment))
        .route(
            "/api/v1/payments/by-address/:address",
            get(payment_api::get_payment_by_address),
        )
        .route(
            "/api/v1/payments/:id/verify",
            get(payment_api::verify_payment_address),
        )
        // 账户
        .route(
            "/api/v1/accounts/:account/xpub",
            get(account_api::get_account_xpub),
        )
        // 链上事件推送
        .route("/api/v1/webhooks/chain", post(webhook_api::chain_webhook))
        // 运维
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(from_fn(trace_id_middleware))
                .layer(from_fn(add_response_time_header))
                .layer(from_fn(trace_log)),
        )
        .with_state(state)
}

async fn add_response_time_header(req: Request, next: axum::middleware::Next) -> Response {
    let start = Instant::now();
    let mut resp = next.run(req).await;
    let elapsed_ms = start.elapsed().as_millis().to_string();
    resp.headers_mut().insert(
        "x-response-time",
        HeaderValue::from_str(&format!("{}ms", elapsed_ms))
            .unwrap_or(HeaderValue::from_static("0ms")),
    );
    resp
}

async fn trace_log(req: Request, next: axum::middleware::Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let trace_id = req
        .extensions()
        .get::<TraceId>()
        .map(|t| t.0.clone())
        .unwrap_or_else(|| "-".to_string());
    let resp = next.run(req).await;
    let status = resp.status();
    let elapsed = start.elapsed().as_millis();
    tracing::event!(Level::INFO, trace_id=%trace_id, method=%method, path=%path, status=%status.as_u16(), elapsed_ms=%elapsed, "http_request");
    resp.into_response()
}
