use crate::models::{EquipmentItem, FeeBreakdown, ParsedInvoice};
use crate::service::rates::{calculate_expected_amount, rental_days, TierRates};
use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use chrono::NaiveDate;
use serde_json::{Map, Value};
use std::str::FromStr;

/// 费用归类结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeClass {
    Freight,
    Tax,
    Meter,
    Fee(String),
}

const TAX_WORDS: &[&str] = &["tax", "taxes", "gst", "hst", "pst", "vat"];
const FREIGHT_STEMS: &[&str] = &[
    "freight", "deliver", "pickup", "haul", "transport", "mobiliz", "mobilis", "demob",
    "trucking",
];
const METER_STEMS: &[&str] = &["meter", "overtime"];
const METER_PHRASES: &[&str] = &["hour usage", "excess hours", "hours over"];

/// 顶层字段中已单独处理的 key, 其余 *_fee / *_charge 字段按费用归类
const CONSUMED_KEYS: &[&str] = &[
    "vendor", "vendor_name", "invoice_number", "invoice_no", "invoice_id", "po_number", "po",
    "invoice_date", "date", "rental_start", "start_date", "date_out", "rental_end", "end_date",
    "date_in", "rental_period", "job_site", "jobsite", "site", "subtotal", "rental_subtotal",
    "freight", "delivery", "delivery_charge", "meter_charges", "meter_charge", "tax",
    "sales_tax", "total", "invoice_total", "equipment", "line_items", "items", "fees",
    "other_charges",
];

/// 模型输出 -> ParsedInvoice
///
/// 数值字段缺失时为 0, 其它字段缺失时为 None。
pub fn normalize_invoice(value: &Value, raw_response: &str) -> ParsedInvoice {
    let empty = Map::new();
    let obj = value.as_object().unwrap_or(&empty);

    let period = field(obj, &["rental_period"]).and_then(Value::as_object);
    let rental_start = field(obj, &["rental_start", "start_date", "date_out"])
        .or_else(|| period.and_then(|p| field(p, &["start", "from"])))
        .and_then(coerce_date);
    let rental_end = field(obj, &["rental_end", "end_date", "date_in"])
        .or_else(|| period.and_then(|p| field(p, &["end", "to"])))
        .and_then(coerce_date);
    let invoice_days = rental_days(rental_start, rental_end);

    let mut freight = money(obj, &["freight", "delivery", "delivery_charge"]);
    let mut tax = money(obj, &["tax", "sales_tax"]);
    let mut meter_charges = money(obj, &["meter_charges", "meter_charge"]);
    let mut fees = FeeBreakdown::new();

    // 顶层 freight/tax/meter 与 *_charge 字段可能重复报同一笔费用
    let explicit = [
        (ChargeClass::Freight, freight.clone()),
        (ChargeClass::Tax, tax.clone()),
        (ChargeClass::Meter, meter_charges.clone()),
    ];
    let mut charges: Vec<(ChargeClass, BigDecimal)> = Vec::new();

    for key in ["fees", "other_charges"] {
        if let Some(entries) = obj.get(key) {
            for (label, amount) in charge_entries(entries) {
                charges.push((classify_charge(&label), amount));
            }
        }
    }

    for (key, v) in obj {
        let key_lower = key.to_lowercase();
        if CONSUMED_KEYS.contains(&key_lower.as_str()) {
            continue;
        }
        let looks_like_charge = key_lower.ends_with("_fee")
            || key_lower.ends_with("_fees")
            || key_lower.ends_with("_charge")
            || key_lower.ends_with("_surcharge");
        if !looks_like_charge {
            continue;
        }
        if let Some(amount) = coerce_money(v) {
            let charge = (classify_charge(&key_lower.replace('_', " ")), amount);
            if explicit.contains(&charge) || charges.contains(&charge) {
                tracing::debug!(key = %key, amount = %charge.1, "跳过重复的费用字段");
                continue;
            }
            charges.push(charge);
        }
    }

    let mut equipment = Vec::new();
    if let Some(lines) = field(obj, &["equipment", "line_items", "items"]).and_then(Value::as_array)
    {
        for line in lines {
            let Some(line) = line.as_object() else {
                continue;
            };
            match parse_line(line, invoice_days) {
                Line::Equipment(item) => equipment.push(item),
                Line::Charge(label, amount) => charges.push((classify_charge(&label), amount)),
                Line::Skip => {}
            }
        }
    }

    for (class, amount) in charges {
        match class {
            ChargeClass::Freight => freight += amount,
            ChargeClass::Tax => tax += amount,
            ChargeClass::Meter => meter_charges += amount,
            ChargeClass::Fee(category) => fees.add(&category, &amount),
        }
    }

    let mut rental_subtotal = money(obj, &["rental_subtotal", "subtotal"]);
    if rental_subtotal.is_zero() {
        rental_subtotal = equipment
            .iter()
            .fold(BigDecimal::zero(), |acc, item| acc + item.charged_amount());
    }

    let mut total = money(obj, &["total", "invoice_total"]);
    if total.is_zero() {
        total = &rental_subtotal + &freight + &meter_charges + fees.total() + &tax;
    }

    ParsedInvoice {
        vendor_name: text(obj, &["vendor_name", "vendor"]),
        invoice_number: text(obj, &["invoice_number", "invoice_no", "invoice_id"]),
        po_number: text(obj, &["po_number", "po"]),
        invoice_date: field(obj, &["invoice_date", "date"]).and_then(coerce_date),
        rental_start,
        rental_end,
        job_site: text(obj, &["job_site", "jobsite", "site"]),
        rental_subtotal: rental_subtotal.round(2),
        freight: freight.round(2),
        meter_charges: meter_charges.round(2),
        fees,
        tax: tax.round(2),
        total: total.round(2),
        equipment,
        raw_response: raw_response.to_string(),
    }
}

enum Line {
    Equipment(EquipmentItem),
    Charge(String, BigDecimal),
    Skip,
}

fn parse_line(line: &Map<String, Value>, invoice_days: Option<i64>) -> Line {
    let description = text(line, &["description", "name", "equipment", "item"]);
    let day_rate = field(line, &["day_rate", "daily_rate", "day"]).and_then(coerce_money);
    let week_rate = field(line, &["week_rate", "weekly_rate", "week"]).and_then(coerce_money);
    let four_week_rate = field(
        line,
        &["four_week_rate", "4_week_rate", "monthly_rate", "month_rate", "four_week", "month"],
    )
    .and_then(coerce_money);
    let billed_amount =
        field(line, &["billed_amount", "amount", "extended_amount", "total"]).and_then(coerce_money);

    let rates = TierRates::new(day_rate, week_rate, four_week_rate);
    let Some(description) = description else {
        return Line::Skip;
    };

    // 无费率且描述命中费用关键字的行不是设备
    if rates.is_empty() {
        if is_charge_label(&description) {
            return match billed_amount {
                Some(amount) => Line::Charge(description, amount),
                None => Line::Skip,
            };
        }
    }

    let quantity = field(line, &["quantity", "qty"])
        .and_then(coerce_money)
        .and_then(|q| q.to_i32())
        .filter(|q| *q > 0)
        .unwrap_or(1);
    let line_days = field(line, &["rental_days", "days"])
        .and_then(coerce_money)
        .and_then(|d| d.to_i64())
        .filter(|d| *d > 0);
    let days = line_days.or(invoice_days).unwrap_or(1);
    let computed_amount =
        (calculate_expected_amount(&rates, days) * BigDecimal::from(quantity)).round(2);

    Line::Equipment(EquipmentItem {
        description,
        equipment_class: text(line, &["equipment_class", "class", "category"]),
        quantity,
        day_rate: rates.day,
        week_rate: rates.week,
        four_week_rate: rates.four_week,
        rental_days: line_days,
        billed_amount,
        computed_amount,
    })
}

/// 费用标签归类: 运费 / 税 / 计时表 / 具体费用分类
pub fn classify_charge(label: &str) -> ChargeClass {
    let lower = label.to_lowercase();
    let words = label_words(&lower);

    if words.iter().any(|w| TAX_WORDS.contains(w)) {
        return ChargeClass::Tax;
    }
    if any_stem(&words, FREIGHT_STEMS) || lower.contains("pick up") {
        if any_stem(&words, &["fuel"]) {
            return ChargeClass::Fee("fuel".to_string());
        }
        if any_stem(&words, &["surcharge"]) {
            return ChargeClass::Fee("delivery_surcharge".to_string());
        }
        return ChargeClass::Freight;
    }
    if any_stem(&words, METER_STEMS) || METER_PHRASES.iter().any(|p| lower.contains(p)) {
        return ChargeClass::Meter;
    }

    match fee_keyword(&lower, &words) {
        Some(category) => ChargeClass::Fee(category.to_string()),
        None => ChargeClass::Fee(slug(&lower)),
    }
}

/// 标签是否命中任一费用关键字 (slug 兜底不算)
pub fn is_charge_label(label: &str) -> bool {
    match classify_charge(label) {
        ChargeClass::Fee(_) => {
            let lower = label.to_lowercase();
            fee_keyword(&lower, &label_words(&lower)).is_some()
        }
        _ => true,
    }
}

fn fee_keyword(lower: &str, words: &[&str]) -> Option<&'static str> {
    if any_stem(words, &["env"]) {
        Some("environmental")
    } else if any_stem(words, &["fuel", "refuel"]) {
        Some("fuel")
    } else if any_stem(words, &["damage", "ldw", "waiver", "rpp", "protection"]) {
        Some("damage_waiver")
    } else if any_stem(words, &["clean"]) {
        Some("cleaning")
    } else if any_stem(words, &["admin", "processing"]) || lower.contains("service charge") {
        Some("admin")
    } else {
        None
    }
}

fn label_words(lower: &str) -> Vec<&str> {
    lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect()
}

fn any_stem(words: &[&str], stems: &[&str]) -> bool {
    words
        .iter()
        .any(|w| stems.iter().any(|stem| w.starts_with(stem)))
}

fn slug(label: &str) -> String {
    let slug = label
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if slug.is_empty() {
        "other".to_string()
    } else {
        slug
    }
}

/// fees 既可能是 {label: amount} 也可能是 [{name, amount}]
fn charge_entries(value: &Value) -> Vec<(String, BigDecimal)> {
    match value {
        Value::Object(map) => map
            .iter()
            .filter_map(|(label, v)| Some((label.replace('_', " "), coerce_money(v)?)))
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_object)
            .filter_map(|entry| {
                let label = text(entry, &["name", "label", "description", "type", "category"])?;
                let amount = field(entry, &["amount", "value", "total"]).and_then(coerce_money)?;
                Some((label, amount))
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn text(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    field(obj, keys).and_then(coerce_string)
}

fn money(obj: &Map<String, Value>, keys: &[&str]) -> BigDecimal {
    field(obj, keys)
        .and_then(coerce_money)
        .unwrap_or_else(BigDecimal::zero)
}

fn coerce_string(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let lowered = s.to_lowercase();
    if s.is_empty() || lowered == "null" || lowered == "n/a" || lowered == "none" {
        None
    } else {
        Some(s)
    }
}

/// 金额解析: 数字, "$1,234.50", "-12", "(12.50)"; 其它文本一律视为缺失
pub fn coerce_money(value: &Value) -> Option<BigDecimal> {
    let parsed = match value {
        Value::Number(n) => BigDecimal::from_str(&n.to_string()).ok(),
        Value::String(s) => parse_money_text(s),
        _ => None,
    };
    parsed.map(|d| d.round(2))
}

fn parse_money_text(s: &str) -> Option<BigDecimal> {
    let mut s = s.trim();
    let mut negative = false;
    if let Some(inner) = s.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        negative = true;
        s = inner.trim();
    }
    if let Some(rest) = s.strip_prefix('-') {
        negative = !negative;
        s = rest.trim_start();
    }
    s = s.strip_prefix('$').map(str::trim_start).unwrap_or(s);
    if !negative {
        if let Some(rest) = s.strip_prefix('-') {
            negative = true;
            s = rest.trim_start();
        }
    }

    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (s, None),
    };
    let int_ok = int_part
        .chars()
        .all(|c| c.is_ascii_digit() || c == ',' || c == ' ');
    let frac_ok = frac_part.map_or(true, |f| f.chars().all(|c| c.is_ascii_digit()));
    let int_digits: String = int_part.chars().filter(char::is_ascii_digit).collect();
    let frac_digits = frac_part.unwrap_or("");
    if !int_ok || !frac_ok || (int_digits.is_empty() && frac_digits.is_empty()) {
        return None;
    }
    // 千分位逗号只允许出现在整数部分的数字之间
    if int_part.starts_with(',') || int_part.trim_end().ends_with(',') {
        return None;
    }

    let number = if frac_digits.is_empty() {
        int_digits
    } else {
        format!("{}.{}", if int_digits.is_empty() { "0" } else { &int_digits }, frac_digits)
    };
    BigDecimal::from_str(&number)
        .ok()
        .map(|d| if negative { -d } else { d })
}

pub fn coerce_date(value: &Value) -> Option<NaiveDate> {
    let s = value.as_str()?.trim();
    if s.is_empty() {
        return None;
    }
    // ISO 时间戳只取日期部分
    let s = s.split('T').next().unwrap_or(s);

    let four_digit_year = s
        .rsplit(['/', '-'])
        .next()
        .map(|y| y.len() == 4)
        .unwrap_or(false);
    let numeric_formats: &[&str] = if four_digit_year {
        &["%m/%d/%Y", "%m-%d-%Y"]
    } else {
        &["%m/%d/%y", "%m-%d-%y"]
    };

    std::iter::once("%Y-%m-%d")
        .chain(numeric_formats.iter().copied())
        .chain(["%b %d, %Y", "%B %d, %Y", "%b %d %Y", "%d-%b-%Y"])
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn classifies_freight_tax_meter_and_fees() {
        assert_eq!(classify_charge("Delivery & Pickup"), ChargeClass::Freight);
        assert_eq!(classify_charge("Round trip hauling"), ChargeClass::Freight);
        assert_eq!(classify_charge("Pick Up Charge"), ChargeClass::Freight);
        assert_eq!(classify_charge("Sales Tax 8.25%"), ChargeClass::Tax);
        assert_eq!(classify_charge("GST"), ChargeClass::Tax);
        assert_eq!(classify_charge("Hour meter overage"), ChargeClass::Meter);
        assert_eq!(classify_charge("Excess hours"), ChargeClass::Meter);
        assert_eq!(
            classify_charge("Delivery fuel surcharge"),
            ChargeClass::Fee("fuel".into())
        );
        assert_eq!(
            classify_charge("Transport Surcharge"),
            ChargeClass::Fee("delivery_surcharge".into())
        );
        assert_eq!(
            classify_charge("Env. Recovery Fee"),
            ChargeClass::Fee("environmental".into())
        );
        assert_eq!(classify_charge("LDW"), ChargeClass::Fee("damage_waiver".into()));
        assert_eq!(
            classify_charge("Rental Protection Plan"),
            ChargeClass::Fee("damage_waiver".into())
        );
        assert_eq!(classify_charge("Service Charge"), ChargeClass::Fee("admin".into()));
        assert_eq!(
            classify_charge("Jobsite Permit"),
            ChargeClass::Fee("jobsite_permit".into())
        );
    }

    #[test]
    fn word_match_avoids_false_tax_hits() {
        // "taxi" 和 "upstream" 不是税
        assert_eq!(
            classify_charge("Taxi upstream"),
            ChargeClass::Fee("taxi_upstream".into())
        );
    }

    #[test]
    fn coerces_money_strings() {
        assert_eq!(coerce_money(&json!("$1,234.50")), Some(dec("1234.50")));
        assert_eq!(coerce_money(&json!("(12.50)")), Some(dec("-12.50")));
        assert_eq!(coerce_money(&json!(99.999)), Some(dec("100.00")));
        assert_eq!(coerce_money(&json!("n/a")), None);
        assert_eq!(coerce_money(&json!(null)), None);
    }

    #[test]
    fn money_rejects_non_numeric_text() {
        assert_eq!(coerce_money(&json!("-$40")), Some(dec("-40")));
        assert_eq!(coerce_money(&json!("$ 2 500")), Some(dec("2500")));
        assert_eq!(coerce_money(&json!(".75")), Some(dec("0.75")));
        assert_eq!(coerce_money(&json!("2 @ $150.00")), None);
        assert_eq!(coerce_money(&json!("03/05/2024")), None);
        assert_eq!(coerce_money(&json!("8.25%")), None);
        assert_eq!(coerce_money(&json!("USD 100")), None);
        assert_eq!(coerce_money(&json!("1.2.3")), None);
        assert_eq!(coerce_money(&json!("-")), None);
    }

    #[test]
    fn garbage_line_amounts_do_not_reach_totals() {
        let value = json!({
            "equipment": [
                {"description": "Boom lift", "day_rate": 300, "days": 1, "amount": "2 @ $150.00"}
            ],
            "tax": "8.25%"
        });
        let invoice = normalize_invoice(&value, "");
        assert!(invoice.equipment[0].billed_amount.is_none());
        assert_eq!(invoice.tax, BigDecimal::zero());
        assert_eq!(invoice.rental_subtotal, dec("300"));
        assert_eq!(invoice.total, dec("300"));
    }

    #[test]
    fn coerces_dates() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 5);
        assert_eq!(coerce_date(&json!("2024-03-05")), expected);
        assert_eq!(coerce_date(&json!("03/05/2024")), expected);
        assert_eq!(coerce_date(&json!("03/05/24")), expected);
        assert_eq!(coerce_date(&json!("Mar 5, 2024")), expected);
        assert_eq!(coerce_date(&json!("2024-03-05T00:00:00Z")), expected);
        assert_eq!(coerce_date(&json!("sometime")), None);
    }

    #[test]
    fn reclassifies_fees_into_freight_and_tax() {
        let value = json!({
            "vendor": "Sunbelt Rentals",
            "invoice_no": "INV-1001",
            "rental_start": "2024-03-01",
            "rental_end": "2024-03-08",
            "fees": {
                "delivery_fee": 150,
                "environmental_fee": "$12.00",
                "sales_tax": 40.10,
                "fuel": 0
            },
            "equipment": [
                {"description": "19' Electric Scissor Lift", "day_rate": 100, "week_rate": 300, "four_week_rate": 900, "amount": 300},
                {"description": "Pickup charge", "amount": "75.00"}
            ],
            "total": null
        });

        let invoice = normalize_invoice(&value, "raw");
        assert_eq!(invoice.vendor_name.as_deref(), Some("Sunbelt Rentals"));
        assert_eq!(invoice.invoice_number.as_deref(), Some("INV-1001"));
        assert_eq!(invoice.freight, dec("225"));
        assert_eq!(invoice.tax, dec("40.10"));
        assert_eq!(invoice.fees.get("environmental"), Some(&dec("12")));
        assert!(invoice.fees.get("fuel").is_none());
        assert_eq!(invoice.equipment.len(), 1);
        assert_eq!(invoice.equipment[0].computed_amount, dec("300"));
        assert_eq!(invoice.rental_subtotal, dec("300"));
        assert_eq!(invoice.total, dec("577.10"));
        assert_eq!(invoice.raw_response, "raw");
    }

    #[test]
    fn fee_arrays_and_top_level_charges() {
        let value = json!({
            "vendor_name": "Herc",
            "subtotal": "1,100.00",
            "total": "1,250.00",
            "other_charges": [
                {"name": "Hour Meter Overage", "amount": 60},
                {"name": "Rental Protection", "amount": "90"}
            ],
            "cleaning_fee": 25,
            "equipment": [
                {"name": "Mini excavator", "qty": "2", "days": 3, "daily_rate": "$200"}
            ]
        });

        let invoice = normalize_invoice(&value, "");
        assert_eq!(invoice.meter_charges, dec("60"));
        assert_eq!(invoice.fees.get("damage_waiver"), Some(&dec("90")));
        assert_eq!(invoice.fees.get("cleaning"), Some(&dec("25")));
        assert_eq!(invoice.rental_subtotal, dec("1100"));
        assert_eq!(invoice.total, dec("1250"));

        let item = &invoice.equipment[0];
        assert_eq!(item.quantity, 2);
        assert_eq!(item.rental_days, Some(3));
        assert_eq!(item.computed_amount, dec("1200"));
    }

    #[test]
    fn rateless_fee_lines_leave_equipment() {
        let value = json!({
            "equipment": [
                {"description": "Boom lift", "day_rate": 300, "days": 1, "amount": 300},
                {"description": "Cleaning", "amount": 45},
                {"description": "Damage Waiver", "amount": 60},
                {"description": "Fuel", "amount": "30.00"}
            ]
        });
        let invoice = normalize_invoice(&value, "");
        let names: Vec<&str> = invoice
            .equipment
            .iter()
            .map(|i| i.description.as_str())
            .collect();
        assert_eq!(names, vec!["Boom lift"]);
        assert_eq!(invoice.fees.get("cleaning"), Some(&dec("45")));
        assert_eq!(invoice.fees.get("damage_waiver"), Some(&dec("60")));
        assert_eq!(invoice.fees.get("fuel"), Some(&dec("30")));
        assert_eq!(invoice.rental_subtotal, dec("300"));
        assert_eq!(invoice.total, dec("435"));
    }

    #[test]
    fn dump_truck_is_equipment_not_freight() {
        let value = json!({
            "equipment": [{"description": "Dump Truck", "amount": 500}],
            "fees": {"Truck wash fee": 25, "Trucking": 80}
        });
        let invoice = normalize_invoice(&value, "");
        assert_eq!(invoice.equipment.len(), 1);
        assert_eq!(invoice.equipment[0].description, "Dump Truck");
        assert_eq!(invoice.freight, dec("80"));
        assert_eq!(invoice.fees.get("truck_wash_fee"), Some(&dec("25")));
        assert_eq!(classify_charge("Dump Truck"), ChargeClass::Fee("dump_truck".into()));
        assert!(!is_charge_label("Dump Truck"));
        assert!(is_charge_label("Cleaning"));
    }

    #[test]
    fn duplicate_top_level_charges_are_counted_once() {
        let value = json!({
            "freight": 150,
            "freight_charge": "150.00",
            "fees": {"environmental": 12},
            "environmental_fee": 12,
            "fuel_surcharge": 20
        });
        let invoice = normalize_invoice(&value, "");
        assert_eq!(invoice.freight, dec("150"));
        assert_eq!(invoice.fees.get("environmental"), Some(&dec("12")));
        assert_eq!(invoice.fees.get("fuel"), Some(&dec("20")));
        assert_eq!(invoice.total, dec("182"));
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let invoice = normalize_invoice(&json!({}), "");
        assert!(invoice.vendor_name.is_none());
        assert!(invoice.equipment.is_empty());
        assert!(invoice.fees.is_empty());
        assert_eq!(invoice.total, BigDecimal::zero());
        assert_eq!(invoice.freight, BigDecimal::zero());
    }
}
