use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

/// 设备租赁明细行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentItem {
    pub description: String,
    pub equipment_class: Option<String>,
    pub quantity: i32,
    pub day_rate: Option<BigDecimal>,
    pub week_rate: Option<BigDecimal>,
    pub four_week_rate: Option<BigDecimal>,
    pub rental_days: Option<i64>,
    /// 发票上印刷的金额
    pub billed_amount: Option<BigDecimal>,
    /// 按发票自身费率重新计算的金额
    pub computed_amount: BigDecimal,
}

impl EquipmentItem {
    /// 实际收费: 优先取发票金额, 否则取计算金额
    pub fn charged_amount(&self) -> BigDecimal {
        self.billed_amount
            .clone()
            .unwrap_or_else(|| self.computed_amount.clone())
    }

    pub fn has_rates(&self) -> bool {
        self.day_rate.is_some() || self.week_rate.is_some() || self.four_week_rate.is_some()
    }
}

/// 费用分类 -> 金额 (保序)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeeBreakdown(IndexMap<String, BigDecimal>);

impl FeeBreakdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// 累加到某个分类, 零金额忽略
    pub fn add(&mut self, category: &str, amount: &BigDecimal) {
        if amount.is_zero() {
            return;
        }
        let entry = self
            .0
            .entry(category.to_string())
            .or_insert_with(BigDecimal::zero);
        *entry = &*entry + amount;
    }

    pub fn get(&self, category: &str) -> Option<&BigDecimal> {
        self.0.get(category)
    }

    pub fn total(&self) -> BigDecimal {
        self.0
            .values()
            .fold(BigDecimal::zero(), |acc, amount| acc + amount)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BigDecimal)> {
        self.0.iter()
    }
}

/// 归一化后的发票 (入库前)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedInvoice {
    pub vendor_name: Option<String>,
    pub invoice_number: Option<String>,
    pub po_number: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub rental_start: Option<NaiveDate>,
    pub rental_end: Option<NaiveDate>,
    pub job_site: Option<String>,
    pub rental_subtotal: BigDecimal,
    pub freight: BigDecimal,
    pub meter_charges: BigDecimal,
    pub fees: FeeBreakdown,
    pub tax: BigDecimal,
    pub total: BigDecimal,
    pub equipment: Vec<EquipmentItem>,
    pub raw_response: String,
}

/// parsed_invoices 表行
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub id: i64,
    pub vendor_name: Option<String>,
    pub invoice_number: Option<String>,
    pub po_number: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub rental_start: Option<NaiveDate>,
    pub rental_end: Option<NaiveDate>,
    pub job_site: Option<String>,
    pub rental_subtotal: BigDecimal,
    pub freight: BigDecimal,
    pub meter_charges: BigDecimal,
    pub fees: Json<FeeBreakdown>,
    pub tax: BigDecimal,
    pub total: BigDecimal,
    pub equipment: Json<Vec<EquipmentItem>>,
    pub market_rate_low: Option<BigDecimal>,
    pub market_rate_high: Option<BigDecimal>,
    pub market_rate_avg: Option<BigDecimal>,
    pub overpaid_amount: Option<BigDecimal>,
    pub data_source: Option<String>,
    #[serde(skip_serializing)]
    pub raw_response: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 列表/导出用的摘要
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct InvoiceSummary {
    pub id: i64,
    pub vendor_name: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub rental_subtotal: BigDecimal,
    pub freight: BigDecimal,
    pub tax: BigDecimal,
    pub total: BigDecimal,
    pub overpaid_amount: Option<BigDecimal>,
    pub data_source: Option<String>,
    pub created_at: DateTime<Utc>,
}
