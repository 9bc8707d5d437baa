use bigdecimal::{BigDecimal, Zero};
use chrono::NaiveDate;
use std::cmp::min;

/// 日/周/四周 三档费率
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TierRates {
    pub day: Option<BigDecimal>,
    pub week: Option<BigDecimal>,
    pub four_week: Option<BigDecimal>,
}

impl TierRates {
    pub fn new(
        day: Option<BigDecimal>,
        week: Option<BigDecimal>,
        four_week: Option<BigDecimal>,
    ) -> Self {
        Self {
            day,
            week,
            four_week,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.day.is_none() && self.week.is_none() && self.four_week.is_none()
    }
}

/// 按租期计算应收金额 (阶梯费率)
///
/// 先按四周拆分, 剩余天数按周计, 零头按日计;
/// 日费部分不超过一周费率, 周+日部分不超过一个四周费率。
/// 缺失的档位由下一档推导: 周 = 7 x 日, 四周 = 4 x 周。
pub fn calculate_expected_amount(rates: &TierRates, days: i64) -> BigDecimal {
    if rates.is_empty() {
        return BigDecimal::zero();
    }
    let days = days.max(1);

    let week = rates
        .week
        .clone()
        .or_else(|| rates.day.as_ref().map(|d| d * &BigDecimal::from(7)));
    let week = match (week, rates.four_week.as_ref()) {
        (Some(w), Some(f)) => Some(min(w, f.clone())),
        (w, _) => w,
    };
    let four_week = match rates.four_week.clone() {
        Some(f) => f,
        None => match week.as_ref() {
            Some(w) => w * &BigDecimal::from(4),
            None => return BigDecimal::zero(),
        },
    };
    // 没有周费率时, 零头按一个四周计
    let unit_week = week.unwrap_or_else(|| four_week.clone());

    let four_weeks = days / 28;
    let rem = days % 28;
    let weeks = rem / 7;
    let odd_days = rem % 7;

    let day_part = if odd_days == 0 {
        BigDecimal::zero()
    } else {
        match rates.day.as_ref() {
            Some(day) => min(day * &BigDecimal::from(odd_days), unit_week.clone()),
            None => unit_week.clone(),
        }
    };
    let week_part = min(
        &unit_week * &BigDecimal::from(weeks) + day_part,
        four_week.clone(),
    );

    (&four_week * &BigDecimal::from(four_weeks) + week_part).round(2)
}

/// 租期天数: 结束日 - 开始日, 当天起租也算 1 天
pub fn rental_days(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Option<i64> {
    let (start, end) = (start?, end?);
    if end < start {
        return None;
    }
    Some((end - start).num_days().max(1))
}
