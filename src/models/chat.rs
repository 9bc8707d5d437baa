use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// 供应商汇总 (assistant 工具)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct VendorSummary {
    pub vendor_name: Option<String>,
    pub invoice_count: i64,
    pub total_billed: Option<BigDecimal>,
    pub total_freight: Option<BigDecimal>,
    pub total_overpaid: Option<BigDecimal>,
}

/// 全部发票的节省汇总
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SavingsTotals {
    pub invoice_count: i64,
    pub compared_count: i64,
    pub total_billed: Option<BigDecimal>,
    pub total_overpaid: Option<BigDecimal>,
}

/// 设备明细搜索命中
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EquipmentHit {
    pub invoice_id: i64,
    pub vendor_name: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub description: Option<String>,
    pub day_rate: Option<String>,
    pub week_rate: Option<String>,
    pub four_week_rate: Option<String>,
}

/// 一次工具调用的记录, 随聊天响应返回
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallLog {
    pub name: String,
    pub arguments: String,
    pub ok: bool,
}
