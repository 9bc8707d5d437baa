use crate::config::VisionConfig;
use crate::error::{AppError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

/// 抽取提示词, 要求模型只返回 JSON
pub const EXTRACTION_PROMPT: &str = r#"You are an accounts-payable auditor for construction equipment rentals.
Read the attached rental invoice and return ONLY a JSON object with this shape:
{
  "vendor_name": "string or null",
  "invoice_number": "string or null",
  "po_number": "string or null",
  "invoice_date": "YYYY-MM-DD or null",
  "rental_start": "YYYY-MM-DD or null",
  "rental_end": "YYYY-MM-DD or null",
  "job_site": "string or null",
  "rental_subtotal": number,
  "freight": number,
  "meter_charges": number,
  "fees": { "<fee label as printed>": number },
  "tax": number,
  "total": number,
  "equipment": [
    {
      "description": "string",
      "equipment_class": "string or null",
      "quantity": integer,
      "day_rate": number or null,
      "week_rate": number or null,
      "four_week_rate": number or null,
      "rental_days": integer or null,
      "amount": number or null
    }
  ]
}

Rules:
- Delivery, pickup, hauling, transport and mobilization charges belong in "freight", not in "fees".
- Sales tax, GST, HST, PST and VAT belong in "tax".
- Hour meter overage and overtime hours belong in "meter_charges".
- Environmental, fuel, damage waiver / rental protection, cleaning and admin charges belong in "fees".
- Rates are the unit rates printed on the invoice (per day, per week, per 4 weeks). "Monthly" means 4 weeks.
- Use 0 for money totals that are not printed and null for anything else you cannot read.
- Do not wrap the JSON in markdown and do not add commentary."#;

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Value>,
    temperature: f64,
    max_tokens: u32,
    response_format: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// 视觉模型客户端 (OpenAI chat completions 兼容接口)
pub struct VisionClient {
    client: Client,
    config: VisionConfig,
}

impl VisionClient {
    pub fn new(config: VisionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn max_image_bytes(&self) -> usize {
        self.config.max_image_bytes
    }

    /// 发送发票图片, 返回模型的原始文本输出
    pub async fn extract(&self, bytes: &[u8], content_type: &str, file_name: &str) -> Result<String> {
        if self.config.api_key.is_empty() {
            return Err(AppError::Internal("vision.api_key is not configured".to_string()));
        }

        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                json!({ "role": "system", "content": EXTRACTION_PROMPT }),
                json!({
                    "role": "user",
                    "content": [
                        { "type": "text", "text": "Extract the fields from this rental invoice." },
                        attachment_part(bytes, content_type, file_name),
                    ],
                }),
            ],
            temperature: 0.0,
            max_tokens: 4096,
            response_format: json!({ "type": "json_object" }),
        };

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let started = std::time::Instant::now();

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.config.api_key.expose())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::upstream("vision", format!("{status}: {body}")));
        }

        let chat_response: ChatResponse = response.json().await?;
        let choice = chat_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::upstream("vision", "empty choices"))?;

        if choice.finish_reason.as_deref() == Some("length") {
            warn!("vision response truncated at max_tokens, relying on JSON repair");
        }

        let content = choice
            .message
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AppError::upstream("vision", "empty message content"))?;

        info!(
            model = %self.config.model,
            bytes = bytes.len(),
            response_len = content.len(),
            elapsed = ?started.elapsed(),
            "vision extraction complete"
        );
        Ok(content)
    }
}

/// 图片走 image_url, PDF 走 file 内容块
fn attachment_part(bytes: &[u8], content_type: &str, file_name: &str) -> Value {
    let data_url = format!("data:{};base64,{}", content_type, STANDARD.encode(bytes));
    if content_type == "application/pdf" {
        json!({
            "type": "file",
            "file": { "filename": file_name, "file_data": data_url },
        })
    } else {
        json!({
            "type": "image_url",
            "image_url": { "url": data_url, "detail": "high" },
        })
    }
}
