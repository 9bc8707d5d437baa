use crate::api::AppState;
use crate::db::{self, queries};
use crate::error::{AppError, Result};
use crate::models::{InvoiceRecord, InvoiceSummary, SavingsSummary, ToolCallLog};
use crate::service::InvoiceUpload;
use axum::{
    extract::{multipart::MultipartError, Json, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

const DEFAULT_LIST_LIMIT: i64 = 20;
const MAX_LIST_LIMIT: i64 = 100;

/// 解析响应
#[derive(Debug, Serialize)]
pub struct ParseResponse {
    pub success: bool,
    pub invoice: InvoiceRecord,
    pub savings: Option<SavingsSummary>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SavingsQuery {
    pub region: Option<String>,
}

/// 聊天请求体
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub thread_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub success: bool,
    pub reply: String,
    pub thread_id: String,
    pub run_id: String,
    pub tool_calls: Vec<ToolCallLog>,
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

/// 数据库连通性检查
pub async fn health_db(State(state): State<AppState>) -> Result<&'static str> {
    db::ping(&state.pool).await?;
    Ok("OK")
}

/// 上传发票图片并解析 (multipart: file / invoice / image, region, compare)
pub async fn parse_invoice(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ParseResponse>> {
    let mut upload = InvoiceUpload {
        compare: true,
        ..Default::default()
    };
    let mut has_file = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(multipart_error)?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" | "invoice" | "image" => {
                upload.content_type = field.content_type().map(str::to_string);
                upload.file_name = field.file_name().map(str::to_string);
                upload.bytes = field
                    .bytes()
                    .await
                    .map_err(multipart_error)?
                    .to_vec();
                has_file = true;
            }
            "region" => {
                let region = field
                    .text()
                    .await
                    .map_err(multipart_error)?;
                let region = region.trim();
                upload.region = (!region.is_empty()).then(|| region.to_string());
            }
            "compare" => {
                let value = field
                    .text()
                    .await
                    .map_err(multipart_error)?;
                upload.compare = !matches!(
                    value.trim().to_lowercase().as_str(),
                    "false" | "0" | "no" | "off"
                );
            }
            other => tracing::debug!(field = %other, "ignoring multipart field"),
        }
    }

    if !has_file {
        return Err(AppError::BadRequest(
            "no invoice file in request (expected field 'file')".to_string(),
        ));
    }

    let outcome = state.invoices.parse_upload(upload).await?;
    Ok(Json(ParseResponse {
        success: true,
        invoice: outcome.invoice,
        savings: outcome.savings,
    }))
}

/// 超过 DefaultBodyLimit 时 multer 报 413, 其余按 400 处理
fn multipart_error(e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::BodyTooLarge(e.body_text())
    } else {
        AppError::BadRequest(e.body_text())
    }
}

/// 最近的发票
pub async fn list_invoices(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<InvoiceSummary>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    Ok(Json(queries::list_recent_invoices(&state.pool, limit).await?))
}

/// 单张发票
pub async fn get_invoice(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<InvoiceRecord>> {
    queries::get_invoice(&state.pool, id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Invoice {}", id)))
}

/// 重新做市场对比
pub async fn recompute_savings(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<SavingsQuery>,
) -> Result<Json<SavingsSummary>> {
    let region = query.region.as_deref().filter(|r| !r.trim().is_empty());
    Ok(Json(state.savings.compare_by_id(id, region).await?))
}

/// 导出 CSV
pub async fn export_csv(State(state): State<AppState>) -> Result<Response> {
    let records = queries::list_all_invoices(&state.pool).await?;
    let mut body = Vec::new();
    queries::export_to_csv(&records, &mut body).map_err(|e| AppError::Internal(e.to_string()))?;
    tracing::info!(rows = records.len(), bytes = body.len(), "CSV export");

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"parsed_invoices.csv\"",
            ),
        ],
        body,
    )
        .into_response())
}

/// 聊天 (托管 assistant + 数据库工具)
pub async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>> {
    let message = req.message.trim();
    if message.is_empty() {
        return Err(AppError::BadRequest("message must not be empty".to_string()));
    }

    let reply = state.assistant.chat(message, req.thread_id).await?;
    Ok(Json(ChatResponse {
        success: true,
        reply: reply.reply,
        thread_id: reply.thread_id,
        run_id: reply.run_id,
        tool_calls: reply.tool_calls,
    }))
}
