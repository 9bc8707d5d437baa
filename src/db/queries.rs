use crate::models::{
    EquipmentHit, EquipmentMatch, InvoiceRecord, InvoiceSummary, MarketRate, ParsedInvoice,
    SavingsSummary, SavingsTotals, VendorSummary,
};
use sqlx::types::Json;
use sqlx::PgPool;
use std::io::Write;
use std::time::Duration;

const INSERT_TIMEOUT: Duration = Duration::from_secs(30);

const INVOICE_COLUMNS: &str = r#"
    id, vendor_name, invoice_number, po_number, invoice_date, rental_start, rental_end,
    job_site, rental_subtotal, freight, meter_charges, fees, tax, total, equipment,
    market_rate_low, market_rate_high, market_rate_avg, overpaid_amount, data_source,
    raw_response, created_at
"#;

const SUMMARY_COLUMNS: &str = r#"
    id, vendor_name, invoice_number, invoice_date, rental_subtotal, freight, tax, total,
    overpaid_amount, data_source, created_at
"#;

/// 写入一张解析后的发票, 返回新 id
pub async fn insert_invoice(pool: &PgPool, invoice: &ParsedInvoice) -> Result<i64, sqlx::Error> {
    let start_time = std::time::Instant::now();

    let query = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO parsed_invoices (
            vendor_name, invoice_number, po_number, invoice_date, rental_start, rental_end,
            job_site, rental_subtotal, freight, meter_charges, fees, tax, total, equipment,
            raw_response
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        RETURNING id
        "#,
    )
    .bind(&invoice.vendor_name)
    .bind(&invoice.invoice_number)
    .bind(&invoice.po_number)
    .bind(invoice.invoice_date)
    .bind(invoice.rental_start)
    .bind(invoice.rental_end)
    .bind(&invoice.job_site)
    .bind(&invoice.rental_subtotal)
    .bind(&invoice.freight)
    .bind(&invoice.meter_charges)
    .bind(Json(&invoice.fees))
    .bind(&invoice.tax)
    .bind(&invoice.total)
    .bind(Json(&invoice.equipment))
    .bind(&invoice.raw_response);

    match tokio::time::timeout(INSERT_TIMEOUT, query.fetch_one(pool)).await {
        Ok(Ok(id)) => {
            tracing::info!(id, elapsed = ?start_time.elapsed(), "✓ parsed_invoices INSERT 成功");
            Ok(id)
        }
        Ok(Err(e)) => {
            tracing::error!(elapsed = ?start_time.elapsed(), error = ?e, "✗ parsed_invoices INSERT 失败");
            Err(e)
        }
        Err(_) => {
            tracing::error!("✗ parsed_invoices INSERT 超时 (>30秒)!");
            Err(sqlx::Error::PoolTimedOut)
        }
    }
}

/// 按 id 查询完整行
pub async fn get_invoice(pool: &PgPool, id: i64) -> Result<Option<InvoiceRecord>, sqlx::Error> {
    sqlx::query_as::<_, InvoiceRecord>(&format!(
        "SELECT {INVOICE_COLUMNS} FROM parsed_invoices WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// 最近的发票摘要
pub async fn list_recent_invoices(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<InvoiceSummary>, sqlx::Error> {
    sqlx::query_as::<_, InvoiceSummary>(&format!(
        "SELECT {SUMMARY_COLUMNS} FROM parsed_invoices ORDER BY created_at DESC, id DESC LIMIT $1"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// 全部发票摘要 (导出)
pub async fn list_all_invoices(pool: &PgPool) -> Result<Vec<InvoiceSummary>, sqlx::Error> {
    sqlx::query_as::<_, InvoiceSummary>(&format!(
        "SELECT {SUMMARY_COLUMNS} FROM parsed_invoices ORDER BY id"
    ))
    .fetch_all(pool)
    .await
}

/// 回写市场对比结果 (每张发票一次)
pub async fn update_savings(
    pool: &PgPool,
    id: i64,
    savings: &SavingsSummary,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE parsed_invoices
        SET market_rate_low = $2,
            market_rate_high = $3,
            market_rate_avg = $4,
            overpaid_amount = $5,
            data_source = $6
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(&savings.market_rate_low)
    .bind(&savings.market_rate_high)
    .bind(&savings.market_rate_avg)
    .bind(&savings.overpaid_amount)
    .bind(&savings.data_source)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// 存储过程: 设备描述 -> 设备分类
pub async fn match_equipment_category(
    pool: &PgPool,
    description: &str,
    equipment_class: Option<&str>,
) -> Result<Option<EquipmentMatch>, sqlx::Error> {
    sqlx::query_as::<_, EquipmentMatch>(
        r#"
        SELECT category_id, category_name, confidence
        FROM match_equipment_category($1, $2)
        LIMIT 1
        "#,
    )
    .bind(description)
    .bind(equipment_class)
    .fetch_optional(pool)
    .await
}

/// 存储过程: 分类 + 区域 -> 市场费率统计
pub async fn get_market_rates(
    pool: &PgPool,
    category_id: i64,
    region: Option<&str>,
) -> Result<Option<MarketRate>, sqlx::Error> {
    sqlx::query_as::<_, MarketRate>(
        r#"
        SELECT day_low, day_avg, day_high,
               week_low, week_avg, week_high,
               four_week_low, four_week_avg, four_week_high,
               sample_size, source
        FROM get_market_rates($1, $2)
        LIMIT 1
        "#,
    )
    .bind(category_id)
    .bind(region)
    .fetch_optional(pool)
    .await
}

/// 供应商汇总 (模糊匹配)
pub async fn vendor_summary(pool: &PgPool, vendor: &str) -> Result<VendorSummary, sqlx::Error> {
    sqlx::query_as::<_, VendorSummary>(
        r#"
        SELECT max(vendor_name) as vendor_name,
               count(*) as invoice_count,
               sum(total) as total_billed,
               sum(freight) as total_freight,
               sum(overpaid_amount) as total_overpaid
        FROM parsed_invoices
        WHERE vendor_name ILIKE '%' || $1 || '%'
        "#,
    )
    .bind(vendor)
    .fetch_one(pool)
    .await
}

/// 全局节省汇总
pub async fn savings_totals(pool: &PgPool) -> Result<SavingsTotals, sqlx::Error> {
    sqlx::query_as::<_, SavingsTotals>(
        r#"
        SELECT count(*) as invoice_count,
               count(overpaid_amount) as compared_count,
               sum(total) as total_billed,
               sum(overpaid_amount) as total_overpaid
        FROM parsed_invoices
        "#,
    )
    .fetch_one(pool)
    .await
}

/// 在设备明细 (jsonb) 中按描述搜索
pub async fn search_equipment(
    pool: &PgPool,
    query: &str,
    limit: i64,
) -> Result<Vec<EquipmentHit>, sqlx::Error> {
    sqlx::query_as::<_, EquipmentHit>(
        r#"
        SELECT pi.id as invoice_id,
               pi.vendor_name,
               pi.invoice_date,
               item->>'description' as description,
               item->>'day_rate' as day_rate,
               item->>'week_rate' as week_rate,
               item->>'four_week_rate' as four_week_rate
        FROM parsed_invoices pi
        CROSS JOIN LATERAL jsonb_array_elements(pi.equipment) AS item
        WHERE item->>'description' ILIKE '%' || $1 || '%'
        ORDER BY pi.created_at DESC
        LIMIT $2
        "#,
    )
    .bind(query)
    .bind(limit)
    .fetch_all(pool)
    .await
}

fn option_to_csv<T: ToString>(val: &Option<T>) -> String {
    val.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

/// 导出发票摘要为 CSV (带表头)
pub fn export_to_csv<W: Write>(
    records: &[InvoiceSummary],
    out: W,
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record([
        "id",
        "vendor_name",
        "invoice_number",
        "invoice_date",
        "rental_subtotal",
        "freight",
        "tax",
        "total",
        "overpaid_amount",
        "data_source",
        "created_at",
    ])?;

    for record in records {
        writer.write_record(&[
            record.id.to_string(),
            option_to_csv(&record.vendor_name),
            option_to_csv(&record.invoice_number),
            option_to_csv(&record.invoice_date),
            record.rental_subtotal.to_string(),
            record.freight.to_string(),
            record.tax.to_string(),
            record.total.to_string(),
            option_to_csv(&record.overpaid_amount),
            option_to_csv(&record.data_source),
            record.created_at.to_rfc3339(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::str::FromStr;

    #[test]
    fn csv_export_has_header_and_blank_nulls() {
        let record = InvoiceSummary {
            id: 7,
            vendor_name: Some("United Rentals, Inc.".into()),
            invoice_number: None,
            invoice_date: NaiveDate::from_ymd_opt(2024, 3, 5),
            rental_subtotal: BigDecimal::from_str("300.00").unwrap(),
            freight: BigDecimal::from_str("150.00").unwrap(),
            tax: BigDecimal::from_str("24.75").unwrap(),
            total: BigDecimal::from_str("474.75").unwrap(),
            overpaid_amount: None,
            data_source: None,
            created_at: Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap(),
        };

        let mut buf = Vec::new();
        export_to_csv(&[record], &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();

        assert!(lines.next().unwrap().starts_with("id,vendor_name,invoice_number"));
        assert_eq!(
            lines.next().unwrap(),
            "7,\"United Rentals, Inc.\",,2024-03-05,300.00,150.00,24.75,474.75,,,2024-03-06T12:00:00+00:00"
        );
    }
}
