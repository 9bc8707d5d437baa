use crate::db::queries;
use crate::error::{AppError, Result};
use crate::models::{InvoiceRecord, SavingsSummary};
use crate::service::json_repair::repair_json;
use crate::service::normalize::normalize_invoice;
use crate::service::rates::rental_days;
use crate::service::savings::SavingsService;
use crate::service::vision::VisionClient;
use sqlx::PgPool;
use std::sync::Arc;

/// 上传的发票文件
#[derive(Debug, Default)]
pub struct InvoiceUpload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub file_name: Option<String>,
    pub region: Option<String>,
    pub compare: bool,
}

/// 解析结果
#[derive(Debug)]
pub struct ParseOutcome {
    pub invoice: InvoiceRecord,
    pub savings: Option<SavingsSummary>,
}

/// 发票解析服务: 视觉抽取 -> JSON 修复 -> 归一化 -> 入库 -> 市场对比
pub struct InvoiceService {
    pool: PgPool,
    vision: VisionClient,
    savings: Arc<SavingsService>,
}

impl InvoiceService {
    pub fn new(pool: PgPool, vision: VisionClient, savings: Arc<SavingsService>) -> Self {
        Self {
            pool,
            vision,
            savings,
        }
    }

    pub async fn parse_upload(&self, upload: InvoiceUpload) -> Result<ParseOutcome> {
        let content_type = validate_upload(&upload, self.vision.max_image_bytes())?;
        let file_name = upload.file_name.as_deref().unwrap_or("invoice");
        tracing::info!(file = %file_name, content_type = %content_type, bytes = upload.bytes.len(), "开始解析发票");

        // 1. 视觉模型抽取
        let raw = self
            .vision
            .extract(&upload.bytes, &content_type, file_name)
            .await?;

        // 2. 修复 + 归一化
        let value = repair_json(&raw).map_err(|e| {
            tracing::warn!(file = %file_name, raw = %raw, "模型输出无法解析为 JSON");
            e
        })?;
        let parsed = normalize_invoice(&value, &raw);
        tracing::info!(
            vendor = ?parsed.vendor_name,
            invoice_number = ?parsed.invoice_number,
            equipment = parsed.equipment.len(),
            fees = parsed.fees.len(),
            total = %parsed.total,
            "发票归一化完成"
        );

        // 3. 入库
        let id = queries::insert_invoice(&self.pool, &parsed).await?;

        // 4. 市场对比 (失败不影响已入库的发票)
        let savings = if upload.compare && !parsed.equipment.is_empty() {
            let days = rental_days(parsed.rental_start, parsed.rental_end);
            match self
                .savings
                .compare_and_store(id, &parsed.equipment, days, upload.region.as_deref())
                .await
            {
                Ok(summary) => Some(summary),
                Err(e) => {
                    tracing::warn!(id, error = %e, "市场对比失败, 仅返回解析结果");
                    None
                }
            }
        } else {
            None
        };

        let invoice = queries::get_invoice(&self.pool, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Invoice {}", id)))?;

        Ok(ParseOutcome { invoice, savings })
    }
}

/// 校验上传文件, 返回规范化后的 content type
pub fn validate_upload(upload: &InvoiceUpload, max_bytes: usize) -> Result<String> {
    if upload.bytes.is_empty() {
        return Err(AppError::BadRequest("uploaded file is empty".to_string()));
    }
    if upload.bytes.len() > max_bytes {
        return Err(AppError::PayloadTooLarge {
            size: upload.bytes.len(),
            limit: max_bytes,
        });
    }

    let declared = upload
        .content_type
        .as_deref()
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_lowercase())
        .filter(|ct| ct != "application/octet-stream" && !ct.is_empty());
    let content_type = declared
        .or_else(|| upload.file_name.as_deref().and_then(guess_from_name))
        .unwrap_or_default();
    let content_type = match content_type.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        _ => content_type,
    };

    let accepted = (content_type.starts_with("image/") && content_type.len() > "image/".len())
        || content_type == "application/pdf";
    if accepted {
        Ok(content_type)
    } else if content_type.is_empty() {
        Err(AppError::UnsupportedMedia("unknown".to_string()))
    } else {
        Err(AppError::UnsupportedMedia(content_type))
    }
}

fn guess_from_name(name: &str) -> Option<String> {
    let ext = name.rsplit_once('.')?.1.to_lowercase();
    let ct = match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "tif" | "tiff" => "image/tiff",
        "heic" => "image/heic",
        "pdf" => "application/pdf",
        _ => return None,
    };
    Some(ct.to_string())
}
