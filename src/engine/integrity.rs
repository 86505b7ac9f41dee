//! Sanity heuristics over stored snapshots. Deliberately loose: only gross
//! violations reject a cache, small portfolios must not trip them.

use crate::domain::Decimal;
use chrono::NaiveDate;
use thiserror::Error;

/// How many of the newest records are checked for a deeply negative NAV.
pub const RECENT_WINDOW: usize = 7;

/// Stored values as read back; `None` marks a field that did not parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub date: NaiveDate,
    pub invested_value: Option<Decimal>,
    pub cash: Option<Decimal>,
    pub nav: Option<Decimal>,
    /// False if any other numeric field failed to parse.
    pub other_fields_finite: bool,
}

impl SnapshotRecord {
    fn is_finite(&self) -> bool {
        self.invested_value.is_some()
            && self.cash.is_some()
            && self.nav.is_some()
            && self.other_fields_finite
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityViolation {
    #[error("nav {nav} on {date} is below -1000")]
    DeeplyNegativeNav { date: NaiveDate, nav: Decimal },
    #[error("{count} of {total} records contain non-finite values")]
    NonFinite { count: usize, total: usize },
    #[error("{count} of {total} records have nav far from invested + cash")]
    NavMismatch { count: usize, total: usize },
}

/// Check date-ordered records.
///
/// # Errors
/// The first violated heuristic.
pub fn validate_integrity(records: &[SnapshotRecord]) -> Result<(), IntegrityViolation> {
    let total = records.len();
    if total == 0 {
        return Ok(());
    }

    let floor = Decimal::from(-1000);
    for record in records.iter().rev().take(RECENT_WINDOW) {
        if let Some(nav) = record.nav.filter(|nav| *nav < floor) {
            return Err(IntegrityViolation::DeeplyNegativeNav {
                date: record.date,
                nav,
            });
        }
    }

    let non_finite = records.iter().filter(|r| !r.is_finite()).count();
    if non_finite * 50 > total {
        return Err(IntegrityViolation::NonFinite {
            count: non_finite,
            total,
        });
    }

    let mismatched = records.iter().filter(|r| nav_mismatch(r)).count();
    if mismatched * 10 > total {
        return Err(IntegrityViolation::NavMismatch {
            count: mismatched,
            total,
        });
    }

    Ok(())
}

fn nav_mismatch(record: &SnapshotRecord) -> bool {
    let (Some(invested), Some(cash), Some(nav)) = (record.invested_value, record.cash, record.nav)
    else {
        return false;
    };
    let Some(expected) = invested.checked_add(cash) else {
        return true;
    };
    let tolerance = Decimal::from(100).max((expected * Decimal::from(5) / Decimal::from(10)).abs());
    nav.checked_sub(expected)
        .map_or(true, |diff| diff.abs() > tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trade::fixtures::d;

    fn record(day: u32, invested: &str, cash: &str, nav: &str) -> SnapshotRecord {
        SnapshotRecord {
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            invested_value: Some(d(invested)),
            cash: Some(d(cash)),
            nav: Some(d(nav)),
            other_fields_finite: true,
        }
    }

    fn healthy(n: u32) -> Vec<SnapshotRecord> {
        (1..=n).map(|i| record(i, "1000", "50", "1050")).collect()
    }

    #[test]
    fn test_empty_and_healthy_pass() {
        assert!(validate_integrity(&[]).is_ok());
        assert!(validate_integrity(&healthy(20)).is_ok());
    }

    #[test]
    fn test_recent_deeply_negative_nav_rejects() {
        let mut records = healthy(20);
        records[15] = record(16, "0", "-1500", "-1500");
        assert!(matches!(
            validate_integrity(&records),
            Err(IntegrityViolation::DeeplyNegativeNav { .. })
        ));
    }

    #[test]
    fn test_old_negative_nav_is_tolerated() {
        let mut records = healthy(20);
        records[2] = record(3, "0", "-1500", "-1500");
        assert!(validate_integrity(&records).is_ok());
    }

    #[test]
    fn test_non_finite_threshold() {
        let mut records = healthy(30);
        records[0].nav = None;
        records[0].other_fields_finite = false;
        assert!(validate_integrity(&records).is_err());

        let mut records = healthy(100);
        records[0].other_fields_finite = false;
        assert!(validate_integrity(&records).is_ok());
    }

    #[test]
    fn test_nav_mismatch_threshold() {
        let mut records = healthy(20);
        records[0] = record(1, "1000", "50", "5000");
        records[1] = record(2, "1000", "50", "5000");
        assert!(validate_integrity(&records).is_ok());

        records[2] = record(3, "1000", "50", "5000");
        assert!(matches!(
            validate_integrity(&records),
            Err(IntegrityViolation::NavMismatch { count: 3, total: 20 })
        ));
    }

    #[test]
    fn test_small_mismatch_within_absolute_tolerance() {
        let records = vec![record(1, "10", "5", "90")];
        assert!(validate_integrity(&records).is_ok());
    }
}
