use crate::service::rates::TierRates;
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// match_equipment_category 存储过程返回
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EquipmentMatch {
    pub category_id: i64,
    pub category_name: String,
    pub confidence: Option<f64>,
}

/// get_market_rates 存储过程返回
#[derive(Debug, Clone, Default, FromRow, Serialize, Deserialize)]
pub struct MarketRate {
    pub day_low: Option<BigDecimal>,
    pub day_avg: Option<BigDecimal>,
    pub day_high: Option<BigDecimal>,
    pub week_low: Option<BigDecimal>,
    pub week_avg: Option<BigDecimal>,
    pub week_high: Option<BigDecimal>,
    pub four_week_low: Option<BigDecimal>,
    pub four_week_avg: Option<BigDecimal>,
    pub four_week_high: Option<BigDecimal>,
    pub sample_size: Option<i64>,
    pub source: Option<String>,
}

impl MarketRate {
    pub fn low(&self) -> TierRates {
        TierRates::new(
            self.day_low.clone(),
            self.week_low.clone(),
            self.four_week_low.clone(),
        )
    }

    pub fn avg(&self) -> TierRates {
        TierRates::new(
            self.day_avg.clone(),
            self.week_avg.clone(),
            self.four_week_avg.clone(),
        )
    }

    pub fn high(&self) -> TierRates {
        TierRates::new(
            self.day_high.clone(),
            self.week_high.clone(),
            self.four_week_high.clone(),
        )
    }
}

/// 单行设备的市场对比
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemComparison {
    pub description: String,
    pub category_id: Option<i64>,
    pub category_name: Option<String>,
    pub rental_days: i64,
    pub charged: BigDecimal,
    pub expected_low: Option<BigDecimal>,
    pub expected_avg: Option<BigDecimal>,
    pub expected_high: Option<BigDecimal>,
    pub overpaid: BigDecimal,
    pub sample_size: Option<i64>,
    pub source: Option<String>,
}

impl ItemComparison {
    pub fn is_matched(&self) -> bool {
        self.expected_avg.is_some()
    }
}

/// 整张发票的节省估算
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavingsSummary {
    pub invoice_id: i64,
    pub matched_items: usize,
    pub market_rate_low: Option<BigDecimal>,
    pub market_rate_high: Option<BigDecimal>,
    pub market_rate_avg: Option<BigDecimal>,
    pub overpaid_amount: BigDecimal,
    pub data_source: String,
    pub items: Vec<ItemComparison>,
}
