//! Domain primitives: TimeMs, PortfolioId, Symbol, Currency and calendar-day helpers.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

/// Format used for every calendar day crossing a boundary (API, storage, provider).
pub const DAY_FORMAT: &str = "%Y-%m-%d";

/// Time in milliseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeMs(pub i64);

impl TimeMs {
    pub fn new(ms: i64) -> Self {
        TimeMs(ms)
    }

    pub fn now() -> Self {
        TimeMs(chrono::Utc::now().timestamp_millis())
    }

    pub fn as_ms(&self) -> i64 {
        self.0
    }
}

/// Portfolio identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortfolioId(pub String);

impl PortfolioId {
    pub fn new(id: impl Into<String>) -> Self {
        PortfolioId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PortfolioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Instrument symbol (e.g., "AAPL", "NOVO-B.CO").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(symbol: impl Into<String>) -> Self {
        Symbol(symbol.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ISO currency code (e.g., "USD").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Currency(pub String);

impl Currency {
    pub fn new(code: impl Into<String>) -> Self {
        Currency(code.into().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Canonical pair symbol converting `self` into `other` (e.g., `USDEUR`).
    pub fn pair_with(&self, other: &Currency) -> String {
        format!("{}{}", self.0, other.0)
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parse a strict `YYYY-MM-DD` day. Anything else (times, short forms,
/// impossible dates such as `2024-13-40`) is rejected.
pub fn parse_day(input: &str) -> Option<NaiveDate> {
    let bytes = input.as_bytes();
    let shape_ok = bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit());
    if !shape_ok {
        return None;
    }
    NaiveDate::parse_from_str(input, DAY_FORMAT).ok()
}

pub fn format_day(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

/// Inclusive iterator over calendar days.
pub fn days_inclusive(from: NaiveDate, till: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    let mut next = Some(from);
    std::iter::from_fn(move || {
        let current = next?;
        if current > till {
            return None;
        }
        next = current.succ_opt();
        Some(current)
    })
}

pub fn days_before(day: NaiveDate, n: i64) -> NaiveDate {
    day - Duration::days(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_day_accepts_strict_format() {
        assert_eq!(
            parse_day("2024-01-10"),
            NaiveDate::from_ymd_opt(2024, 1, 10)
        );
    }

    #[test]
    fn test_parse_day_rejects_invalid() {
        assert_eq!(parse_day("2024-13-40"), None);
        assert_eq!(parse_day("2024-1-10"), None);
        assert_eq!(parse_day("2024-01-10T00:00:00"), None);
        assert_eq!(parse_day("20240110"), None);
        assert_eq!(parse_day("2023-02-29"), None);
    }

    #[test]
    fn test_days_inclusive_spans_month_end() {
        let from = NaiveDate::from_ymd_opt(2024, 1, 30).unwrap();
        let till = NaiveDate::from_ymd_opt(2024, 2, 2).unwrap();
        let days: Vec<String> = days_inclusive(from, till).map(format_day).collect();
        assert_eq!(
            days,
            vec!["2024-01-30", "2024-01-31", "2024-02-01", "2024-02-02"]
        );
    }

    #[test]
    fn test_days_inclusive_empty_when_reversed() {
        let from = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let till = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(days_inclusive(from, till).count(), 0);
    }

    #[test]
    fn test_currency_pair_symbol() {
        let usd = Currency::new("usd");
        let eur = Currency::new("EUR");
        assert_eq!(usd.pair_with(&eur), "USDEUR");
    }
}
