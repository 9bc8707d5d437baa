use crate::db::queries;
use crate::error::{AppError, Result};
use crate::models::{EquipmentItem, InvoiceRecord, ItemComparison, MarketRate, SavingsSummary};
use crate::service::rates::{calculate_expected_amount, rental_days, TierRates};
use bigdecimal::{BigDecimal, Zero};
use futures::future::try_join_all;
use indexmap::IndexSet;
use sqlx::PgPool;
use std::cmp::max;

/// 市场费率对比服务
pub struct SavingsService {
    pool: PgPool,
}

impl SavingsService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 重新对比并回写 (POST /api/invoices/{id}/savings)
    pub async fn compare_by_id(&self, id: i64, region: Option<&str>) -> Result<SavingsSummary> {
        let invoice = queries::get_invoice(&self.pool, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Invoice {}", id)))?;
        self.compare_and_store(invoice.id, &invoice.equipment.0, invoice_days(&invoice), region)
            .await
    }

    /// 逐行调用两个存储过程, 汇总后更新发票行
    pub async fn compare_and_store(
        &self,
        invoice_id: i64,
        equipment: &[EquipmentItem],
        invoice_days: Option<i64>,
        region: Option<&str>,
    ) -> Result<SavingsSummary> {
        let lookups = equipment
            .iter()
            .map(|item| self.compare_item(item, invoice_days, region));
        let items = try_join_all(lookups).await?;

        let summary = summarize(invoice_id, items);
        queries::update_savings(&self.pool, invoice_id, &summary).await?;

        tracing::info!(
            invoice_id,
            matched = summary.matched_items,
            total_items = summary.items.len(),
            overpaid = %summary.overpaid_amount,
            source = %summary.data_source,
            "市场对比完成"
        );
        Ok(summary)
    }

    async fn compare_item(
        &self,
        item: &EquipmentItem,
        invoice_days: Option<i64>,
        region: Option<&str>,
    ) -> Result<ItemComparison> {
        let days = item.rental_days.or(invoice_days).unwrap_or(1);

        let category = queries::match_equipment_category(
            &self.pool,
            &item.description,
            item.equipment_class.as_deref(),
        )
        .await?;
        let Some(category) = category else {
            tracing::debug!(description = %item.description, "设备未匹配到分类");
            return Ok(unmatched(item, days, None, None));
        };

        let market = queries::get_market_rates(&self.pool, category.category_id, region).await?;
        let Some(market) = market else {
            tracing::debug!(category = %category.category_name, "分类无市场费率");
            return Ok(unmatched(
                item,
                days,
                Some(category.category_id),
                Some(category.category_name),
            ));
        };

        Ok(compare_against(
            item,
            days,
            category.category_id,
            category.category_name,
            &market,
        ))
    }
}

fn invoice_days(invoice: &InvoiceRecord) -> Option<i64> {
    rental_days(invoice.rental_start, invoice.rental_end)
}

fn unmatched(
    item: &EquipmentItem,
    days: i64,
    category_id: Option<i64>,
    category_name: Option<String>,
) -> ItemComparison {
    ItemComparison {
        description: item.description.clone(),
        category_id,
        category_name,
        rental_days: days,
        charged: item.charged_amount(),
        expected_low: None,
        expected_avg: None,
        expected_high: None,
        overpaid: BigDecimal::zero(),
        sample_size: None,
        source: None,
    }
}

/// 单行: 按市场三档费率计算期望金额, 超出均值部分记为多付
pub fn compare_against(
    item: &EquipmentItem,
    days: i64,
    category_id: i64,
    category_name: String,
    market: &MarketRate,
) -> ItemComparison {
    let quantity = BigDecimal::from(item.quantity.max(1));
    let expected = |rates: TierRates| (calculate_expected_amount(&rates, days) * &quantity).round(2);

    let avg_rates = market.avg();
    let expected_avg = (!avg_rates.is_empty()).then(|| expected(avg_rates));
    let expected_low = (!market.low().is_empty()).then(|| expected(market.low()));
    let expected_high = (!market.high().is_empty()).then(|| expected(market.high()));

    let charged = item.charged_amount();
    let overpaid = match &expected_avg {
        Some(avg) => max(&charged - avg, BigDecimal::zero()).round(2),
        None => BigDecimal::zero(),
    };

    ItemComparison {
        description: item.description.clone(),
        category_id: Some(category_id),
        category_name: Some(category_name),
        rental_days: days,
        charged,
        expected_low,
        expected_avg,
        expected_high,
        overpaid,
        sample_size: market.sample_size,
        source: market.source.clone(),
    }
}

/// 汇总: 已匹配行的期望金额求和, 多付求和, 数据来源去重拼接
pub fn summarize(invoice_id: i64, items: Vec<ItemComparison>) -> SavingsSummary {
    let matched: Vec<&ItemComparison> = items.iter().filter(|i| i.is_matched()).collect();

    let sum_of = |pick: fn(&ItemComparison) -> Option<&BigDecimal>| -> Option<BigDecimal> {
        if matched.is_empty() {
            return None;
        }
        Some(
            matched
                .iter()
                .filter_map(|i| pick(i))
                .fold(BigDecimal::zero(), |acc, v| acc + v)
                .round(2),
        )
    };

    let market_rate_low = sum_of(|i| i.expected_low.as_ref());
    let market_rate_avg = sum_of(|i| i.expected_avg.as_ref());
    let market_rate_high = sum_of(|i| i.expected_high.as_ref());

    let overpaid_amount = items
        .iter()
        .fold(BigDecimal::zero(), |acc, i| acc + &i.overpaid)
        .round(2);

    let sources: IndexSet<&str> = matched
        .iter()
        .filter_map(|i| i.source.as_deref())
        .filter(|s| !s.is_empty())
        .collect();
    let data_source = if sources.is_empty() {
        "none".to_string()
    } else {
        sources.into_iter().collect::<Vec<_>>().join(", ")
    };

    SavingsSummary {
        invoice_id,
        matched_items: matched.len(),
        market_rate_low,
        market_rate_high,
        market_rate_avg,
        overpaid_amount,
        data_source,
        items,
    }
}
