use serde::Serialize;
use utoipa::ToSchema;

/// 错误响应文档结构（OpenAPI）
#[derive(Serialize, ToSchema)]
pub struct ErrorBodyDoc {
    pub code: String,
    pub message: String,
    pub trace_id: Option<String>,
}
