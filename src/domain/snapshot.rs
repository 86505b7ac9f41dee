//! Persisted daily valuation records and the coverage metadata derived from them.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::{Decimal, PortfolioId, TimeMs};

/// One day's valuation of a portfolio, in the portfolio currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuationSnapshot {
    pub portfolio_id: PortfolioId,
    pub date: NaiveDate,
    pub invested_value: Decimal,
    pub cash: Decimal,
    pub nav: Decimal,
    pub benchmark_index_value: Decimal,
    pub performance: Decimal,
    pub share_count: Decimal,
    pub nav_per_share: Decimal,
    pub perf_per_share: Decimal,
    pub last_updated: TimeMs,
    pub is_calculated: bool,
}

impl ValuationSnapshot {
    /// Zero-valued record for a portfolio without trades. The share count is
    /// one, matching the replay's fallback when no fund shares exist.
    pub fn baseline(portfolio_id: PortfolioId, date: NaiveDate, now: TimeMs) -> Self {
        Self {
            portfolio_id,
            date,
            invested_value: Decimal::zero(),
            cash: Decimal::zero(),
            nav: Decimal::zero(),
            benchmark_index_value: Decimal::zero(),
            performance: Decimal::zero(),
            share_count: Decimal::one(),
            nav_per_share: Decimal::zero(),
            perf_per_share: Decimal::zero(),
            last_updated: now,
            is_calculated: true,
        }
    }

    pub fn rounded(&self, precision: u32) -> Self {
        Self {
            invested_value: self.invested_value.round_dp(precision),
            cash: self.cash.round_dp(precision),
            nav: self.nav.round_dp(precision),
            benchmark_index_value: self.benchmark_index_value.round_dp(precision),
            performance: self.performance.round_dp(precision),
            share_count: self.share_count,
            nav_per_share: self.nav_per_share.round_dp(precision),
            perf_per_share: self.perf_per_share.round_dp(precision),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalculationStatus {
    Complete,
    Partial,
    Outdated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub till: NaiveDate,
}

/// Coverage of the stored snapshots for one portfolio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageMetadata {
    pub portfolio_id: PortfolioId,
    pub total_records: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<TimeMs>,
    pub calculation_status: CalculationStatus,
}

impl CoverageMetadata {
    pub fn empty(portfolio_id: PortfolioId) -> Self {
        Self {
            portfolio_id,
            total_records: 0,
            date_range: None,
            last_updated: None,
            calculation_status: CalculationStatus::Outdated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes_camel_case_with_plain_date() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let snap = ValuationSnapshot::baseline(PortfolioId::new("p1"), day, TimeMs::new(5));
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["date"], "2024-01-10");
        assert_eq!(json["portfolioId"], "p1");
        assert!(json["navPerShare"].is_number());
        assert_eq!(json["shareCount"], 1.0);
    }

    #[test]
    fn test_rounded_keeps_identity_fields() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let mut snap = ValuationSnapshot::baseline(PortfolioId::new("p1"), day, TimeMs::new(5));
        snap.nav = Decimal::from_str_canonical("12.3456").unwrap();
        let rounded = snap.rounded(2);
        assert_eq!(rounded.nav.to_canonical_string(), "12.35");
        assert_eq!(rounded.date, day);
        assert_eq!(rounded.last_updated, TimeMs::new(5));
    }
}
