//! 账户 API
//!
//! 导出账户级扩展公钥，供外部只读审计或独立核对地址派生。

use std::sync::Arc;

use axum::{
    extract::{rejection::PathRejection, Path, State},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    api::response::{success_response, ApiResponse},
    app_state::AppState,
    domain::{derivation_path::MAX_CHILD_INDEX, AccountScope, Network},
    error::AppError,
    metrics,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct AccountXpub {
    pub account: u32,
    pub network: Network,
    /// witness / legacy
    pub address_kind: String,
    /// 账户级路径，如 m/84'/1'/0'
    pub derivation_path: String,
    pub xpub: String,
}

#[utoipa::path(
    get,
    path = "/api/v1/accounts/{account}/xpub",
    params(("account" = u32, Path, description = "BIP44 account index (non-hardened value)")),
    responses(
        (status = 200, description = "Account extended public key", body = AccountXpub),
        (status = 400, description = "Invalid account index", body = crate::error_body::ErrorBodyDoc)
    )
)]
pub async fn get_account_xpub(
    State(st): State<Arc<AppState>>,
    path: Result<Path<u32>, PathRejection>,
) -> Result<Json<ApiResponse<AccountXpub>>, AppError> {
    let account = path
        .map(|Path(account)| account)
        .map_err(|e| AppError::bad_request(format!("invalid account index: {}", e.body_text())))?;
    if account > MAX_CHILD_INDEX {
        return Err(AppError::bad_request(format!(
            "account index must not exceed {}",
            MAX_CHILD_INDEX
        )));
    }

    let scope = AccountScope {
        network: st.config.payment.network,
        kind: st.config.payment.address_kind,
        account,
    };
    let xpub = st.vault.account_xpub(scope)?;

    metrics::count_ok("GET /api/v1/accounts/:account/xpub");
    success_response(AccountXpub {
        account,
        network: scope.network,
        address_kind: scope.kind.as_str().to_string(),
        derivation_path: scope.to_string(),
        xpub,
    })
}
