//! Valuation snapshot store: upserts, range reads, coverage and retention.

use crate::domain::{
    format_day, parse_day, CalculationStatus, CoverageMetadata, DateRange, Decimal, PortfolioId,
    TimeMs, ValuationSnapshot,
};
use crate::engine::SnapshotRecord;
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::{info, warn};

use super::Repository;

/// Stored snapshot with decimal columns kept as raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRow {
    pub portfolio_id: PortfolioId,
    pub date: NaiveDate,
    pub invested_value: String,
    pub cash: String,
    pub nav: String,
    pub benchmark_index_value: String,
    pub performance: String,
    pub share_count: String,
    pub nav_per_share: String,
    pub perf_per_share: String,
    pub last_updated: TimeMs,
    pub is_calculated: bool,
}

impl SnapshotRow {
    fn parse(raw: &str) -> Option<Decimal> {
        Decimal::from_str_canonical(raw).ok()
    }

    /// Values as seen by the integrity heuristics.
    pub fn to_record(&self) -> SnapshotRecord {
        let others = [
            &self.benchmark_index_value,
            &self.performance,
            &self.share_count,
            &self.nav_per_share,
            &self.perf_per_share,
        ];
        SnapshotRecord {
            date: self.date,
            invested_value: Self::parse(&self.invested_value),
            cash: Self::parse(&self.cash),
            nav: Self::parse(&self.nav),
            other_fields_finite: others.iter().all(|raw| Self::parse(raw).is_some()),
        }
    }

    /// Typed snapshot, or `None` if any numeric column does not parse.
    pub fn to_snapshot(&self) -> Option<ValuationSnapshot> {
        Some(ValuationSnapshot {
            portfolio_id: self.portfolio_id.clone(),
            date: self.date,
            invested_value: Self::parse(&self.invested_value)?,
            cash: Self::parse(&self.cash)?,
            nav: Self::parse(&self.nav)?,
            benchmark_index_value: Self::parse(&self.benchmark_index_value)?,
            performance: Self::parse(&self.performance)?,
            share_count: Self::parse(&self.share_count)?,
            nav_per_share: Self::parse(&self.nav_per_share)?,
            perf_per_share: Self::parse(&self.perf_per_share)?,
            last_updated: self.last_updated,
            is_calculated: self.is_calculated,
        })
    }
}

/// Result of one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionStats {
    pub deleted_records: u64,
    pub portfolios_affected: u64,
}

/// Diagnostic scan of one portfolio's stored history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioDataReport {
    pub portfolio_id: PortfolioId,
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub total_records: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
}

const SELECT_COLUMNS: &str = r#"
    SELECT portfolio_id, date, invested_value, cash, nav, benchmark_index_value,
           performance, share_count, nav_per_share, perf_per_share,
           last_updated_ms, is_calculated
    FROM valuation_snapshots
"#;

fn row_to_snapshot_row(row: &SqliteRow) -> Option<SnapshotRow> {
    let date_raw: String = row.get("date");
    let Some(date) = parse_day(&date_raw) else {
        warn!(date = %date_raw, "Skipping snapshot row with invalid date");
        return None;
    };
    Some(SnapshotRow {
        portfolio_id: PortfolioId::new(row.get::<String, _>("portfolio_id")),
        date,
        invested_value: row.get("invested_value"),
        cash: row.get("cash"),
        nav: row.get("nav"),
        benchmark_index_value: row.get("benchmark_index_value"),
        performance: row.get("performance"),
        share_count: row.get("share_count"),
        nav_per_share: row.get("nav_per_share"),
        perf_per_share: row.get("perf_per_share"),
        last_updated: TimeMs::new(row.get::<i64, _>("last_updated_ms")),
        is_calculated: row.get::<i32, _>("is_calculated") != 0,
    })
}

async fn upsert_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    snapshots: &[ValuationSnapshot],
) -> Result<usize, sqlx::Error> {
    let mut written = 0usize;
    for snap in snapshots {
        let result = sqlx::query(
            r#"
            INSERT INTO valuation_snapshots (
                portfolio_id, date, invested_value, cash, nav, benchmark_index_value,
                performance, share_count, nav_per_share, perf_per_share,
                last_updated_ms, is_calculated
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(portfolio_id, date) DO UPDATE SET
                invested_value = excluded.invested_value,
                cash = excluded.cash,
                nav = excluded.nav,
                benchmark_index_value = excluded.benchmark_index_value,
                performance = excluded.performance,
                share_count = excluded.share_count,
                nav_per_share = excluded.nav_per_share,
                perf_per_share = excluded.perf_per_share,
                last_updated_ms = excluded.last_updated_ms,
                is_calculated = excluded.is_calculated
            "#,
        )
        .bind(snap.portfolio_id.as_str())
        .bind(format_day(snap.date))
        .bind(snap.invested_value.to_canonical_string())
        .bind(snap.cash.to_canonical_string())
        .bind(snap.nav.to_canonical_string())
        .bind(snap.benchmark_index_value.to_canonical_string())
        .bind(snap.performance.to_canonical_string())
        .bind(snap.share_count.to_canonical_string())
        .bind(snap.nav_per_share.to_canonical_string())
        .bind(snap.perf_per_share.to_canonical_string())
        .bind(snap.last_updated.as_ms())
        .bind(snap.is_calculated as i32)
        .execute(&mut **tx)
        .await?;
        written += result.rows_affected() as usize;
    }
    Ok(written)
}

impl Repository {
    /// Upsert snapshots keyed by (portfolio, date) in a single transaction.
    ///
    /// Returns the number of rows written.
    ///
    /// # Errors
    /// Returns an error if the transaction fails; nothing is written then.
    pub async fn upsert_snapshots(
        &self,
        snapshots: &[ValuationSnapshot],
    ) -> Result<usize, sqlx::Error> {
        if snapshots.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let written = upsert_in_tx(&mut tx, snapshots).await?;
        tx.commit().await?;
        Ok(written)
    }

    /// Replace a portfolio's stored history with `snapshots`: rows outside
    /// the new date span are deleted and the rest upserted, atomically.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn replace_history(
        &self,
        portfolio_id: &PortfolioId,
        snapshots: &[ValuationSnapshot],
    ) -> Result<usize, sqlx::Error> {
        let (Some(first), Some(last)) = (
            snapshots.iter().map(|s| s.date).min(),
            snapshots.iter().map(|s| s.date).max(),
        ) else {
            return Ok(0);
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM valuation_snapshots WHERE portfolio_id = ? AND (date < ? OR date > ?)",
        )
        .bind(portfolio_id.as_str())
        .bind(format_day(first))
        .bind(format_day(last))
        .execute(&mut *tx)
        .await?;
        let written = upsert_in_tx(&mut tx, snapshots).await?;
        tx.commit().await?;
        Ok(written)
    }

    /// Stored rows for a portfolio in date order, optionally bounded (inclusive).
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_snapshot_rows(
        &self,
        portfolio_id: &PortfolioId,
        from: Option<NaiveDate>,
        till: Option<NaiveDate>,
    ) -> Result<Vec<SnapshotRow>, sqlx::Error> {
        let from = from.map(format_day).unwrap_or_else(|| "0000-01-01".to_string());
        let till = till.map(format_day).unwrap_or_else(|| "9999-12-31".to_string());

        let sql = format!(
            "{} WHERE portfolio_id = ? AND date >= ? AND date <= ? ORDER BY date ASC",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(portfolio_id.as_str())
            .bind(from)
            .bind(till)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().filter_map(row_to_snapshot_row).collect())
    }

    /// Typed snapshots for a range; rows with unparseable values are skipped.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_snapshots(
        &self,
        portfolio_id: &PortfolioId,
        from: Option<NaiveDate>,
        till: Option<NaiveDate>,
    ) -> Result<Vec<ValuationSnapshot>, sqlx::Error> {
        let rows = self.query_snapshot_rows(portfolio_id, from, till).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let snapshot = row.to_snapshot();
                if snapshot.is_none() {
                    warn!(
                        portfolio_id = %row.portfolio_id,
                        date = %row.date,
                        "Skipping snapshot row with unparseable values"
                    );
                }
                snapshot
            })
            .collect())
    }

    /// Coverage of a portfolio's stored history.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn coverage_metadata(
        &self,
        portfolio_id: &PortfolioId,
    ) -> Result<CoverageMetadata, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   MIN(date) AS first_date,
                   MAX(date) AS last_date,
                   MAX(last_updated_ms) AS last_updated_ms,
                   COALESCE(SUM(CASE WHEN is_calculated = 0 THEN 1 ELSE 0 END), 0) AS outdated
            FROM valuation_snapshots
            WHERE portfolio_id = ?
            "#,
        )
        .bind(portfolio_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.get("total");
        if total == 0 {
            return Ok(CoverageMetadata::empty(portfolio_id.clone()));
        }

        let date_range = match (
            row.get::<Option<String>, _>("first_date")
                .as_deref()
                .and_then(parse_day),
            row.get::<Option<String>, _>("last_date")
                .as_deref()
                .and_then(parse_day),
        ) {
            (Some(from), Some(till)) => Some(DateRange { from, till }),
            _ => None,
        };
        let outdated: i64 = row.get("outdated");
        let span = date_range.map(|r| (r.till - r.from).num_days() + 1);

        let calculation_status = if outdated > 0 {
            CalculationStatus::Outdated
        } else if span.map_or(true, |days| days > total) {
            CalculationStatus::Partial
        } else {
            CalculationStatus::Complete
        };

        Ok(CoverageMetadata {
            portfolio_id: portfolio_id.clone(),
            total_records: total,
            date_range,
            last_updated: row
                .get::<Option<i64>, _>("last_updated_ms")
                .map(TimeMs::new),
            calculation_status,
        })
    }

    /// Delete every stored snapshot of a portfolio. Returns the rows removed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn delete_history(&self, portfolio_id: &PortfolioId) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM valuation_snapshots WHERE portfolio_id = ?")
            .bind(portfolio_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Flag a portfolio's stored snapshots as not calculated (ledger changed).
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn mark_outdated(&self, portfolio_id: &PortfolioId) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE valuation_snapshots SET is_calculated = 0 WHERE portfolio_id = ?",
        )
        .bind(portfolio_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete snapshots dated before `cutoff` across all portfolios.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn delete_snapshots_before(
        &self,
        cutoff: NaiveDate,
    ) -> Result<RetentionStats, sqlx::Error> {
        let cutoff = format_day(cutoff);
        let mut tx = self.pool.begin().await?;

        let affected: i64 = sqlx::query(
            "SELECT COUNT(DISTINCT portfolio_id) AS n FROM valuation_snapshots WHERE date < ?",
        )
        .bind(&cutoff)
        .fetch_one(&mut *tx)
        .await?
        .get("n");

        let result = sqlx::query("DELETE FROM valuation_snapshots WHERE date < ?")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let stats = RetentionStats {
            deleted_records: result.rows_affected(),
            portfolios_affected: affected.max(0) as u64,
        };
        info!(
            cutoff = %cutoff,
            deleted = stats.deleted_records,
            portfolios = stats.portfolios_affected,
            "Retention applied"
        );
        Ok(stats)
    }

    /// Portfolios whose stored history needs recomputation: newest update
    /// older than `stale_before`, rows flagged not calculated, or active
    /// trades without any stored snapshot.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn portfolios_needing_update(
        &self,
        stale_before: TimeMs,
    ) -> Result<Vec<PortfolioId>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT portfolio_id FROM valuation_snapshots
            GROUP BY portfolio_id
            HAVING MAX(last_updated_ms) < ? OR MIN(is_calculated) = 0
            UNION
            SELECT DISTINCT t.portfolio_id FROM trades t
            WHERE t.state = 'active'
              AND NOT EXISTS (
                  SELECT 1 FROM valuation_snapshots v WHERE v.portfolio_id = t.portfolio_id
              )
            ORDER BY portfolio_id ASC
            "#,
        )
        .bind(stale_before.as_ms())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| PortfolioId::new(row.get::<String, _>("portfolio_id")))
            .collect())
    }

    /// Scan stored dates for gaps and count records with negative values.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn validate_portfolio_data(
        &self,
        portfolio_id: &PortfolioId,
    ) -> Result<PortfolioDataReport, sqlx::Error> {
        let metadata = self.coverage_metadata(portfolio_id).await?;
        if metadata.total_records == 0 {
            return Ok(PortfolioDataReport {
                portfolio_id: portfolio_id.clone(),
                is_valid: false,
                issues: vec!["No history data found for portfolio".to_string()],
                total_records: 0,
                date_range: None,
            });
        }

        let rows = self.query_snapshot_rows(portfolio_id, None, None).await?;
        let mut issues = Vec::new();

        for pair in rows.windows(2) {
            let missing = (pair[1].date - pair[0].date).num_days() - 1;
            if missing > 0 {
                issues.push(format!(
                    "Gap detected between {} and {} ({} days missing)",
                    format_day(pair[0].date),
                    format_day(pair[1].date),
                    missing
                ));
            }
        }

        let negative = rows
            .iter()
            .filter(|row| {
                let record = row.to_record();
                [record.nav, record.invested_value, record.cash]
                    .iter()
                    .any(|v| v.map_or(false, |v| v.is_negative()))
            })
            .count();
        if negative > 0 {
            issues.push(format!("{} records have negative values", negative));
        }

        Ok(PortfolioDataReport {
            portfolio_id: portfolio_id.clone(),
            is_valid: issues.is_empty(),
            issues,
            total_records: metadata.total_records,
            date_range: metadata.date_range,
        })
    }
}
