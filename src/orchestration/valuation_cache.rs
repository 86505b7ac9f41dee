//! Serves stored valuation history, recomputing it when it is missing,
//! stale, flagged outdated or fails the integrity heuristics.

use crate::db::Repository;
use crate::domain::{
    CalculationStatus, CoverageMetadata, PortfolioId, Symbol, TimeMs, ValuationSnapshot,
};
use crate::engine::{validate_integrity, TradeDetail};
use crate::pricing::PriceRateCache;
use chrono::NaiveDate;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use super::replay::{LedgerReplayEngine, ReplayError};

/// Decimal places kept in the snapshot store.
pub const STORED_PRECISION: u32 = 6;

#[derive(Debug, Error)]
pub enum ValuationError {
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct HistoryRequest {
    /// Portfolio id or name.
    pub portfolio: String,
    pub from: Option<NaiveDate>,
    pub till: Option<NaiveDate>,
    pub precision: u32,
    pub max_age_minutes: i64,
}

#[derive(Debug, Clone)]
pub struct HistoryResponse {
    pub snapshots: Vec<ValuationSnapshot>,
    pub served_from_cache: bool,
    pub cache_age_minutes: Option<i64>,
    pub metadata: Option<CoverageMetadata>,
    pub info: Option<String>,
    /// Trades applied in the requested range. Empty when served from the store.
    pub details: Vec<TradeDetail>,
}

impl HistoryResponse {
    fn degraded(pid: &PortfolioId, context: &str, error: &dyn fmt::Display) -> Self {
        warn!(portfolio_id = %pid, error = %error, "{}", context);
        Self {
            snapshots: Vec::new(),
            served_from_cache: false,
            cache_age_minutes: None,
            metadata: None,
            info: Some(format!("{}: {}", context, error)),
            details: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub records_written: usize,
    pub symbols_without_price_data: Vec<Symbol>,
    pub degraded_days: usize,
    /// Every trade of the replayed ledger, at stored precision.
    pub details: Vec<TradeDetail>,
}

/// Whether data updated at `last_updated` is still within `max_age_minutes` at `now`.
pub fn is_fresh(last_updated: TimeMs, now: TimeMs, max_age_minutes: i64) -> bool {
    let age_ms = now.as_ms().saturating_sub(last_updated.as_ms());
    age_ms < max_age_minutes.saturating_mul(60_000)
}

fn interpolation_note(symbols: &[Symbol]) -> Option<String> {
    if symbols.is_empty() {
        return None;
    }
    let names: Vec<&str> = symbols.iter().map(|s| s.as_str()).collect();
    Some(format!(
        "Prices reconstructed from trade prices for: {}",
        names.join(", ")
    ))
}

/// Details of trades dated within `[from, till]`, cash rounded to `precision`.
fn details_in_range(
    details: &[TradeDetail],
    from: Option<NaiveDate>,
    till: Option<NaiveDate>,
    precision: u32,
) -> Vec<TradeDetail> {
    details
        .iter()
        .filter(|t| {
            let date = t.trade_time.date();
            from.map_or(true, |start| date >= start) && till.map_or(true, |end| date <= end)
        })
        .map(|t| t.rounded(precision))
        .collect()
}

#[derive(Clone)]
pub struct ValuationCache {
    repo: Arc<Repository>,
    engine: LedgerReplayEngine,
    prices: Arc<dyn PriceRateCache>,
}

impl ValuationCache {
    pub fn new(repo: Arc<Repository>, prices: Arc<dyn PriceRateCache>) -> Self {
        Self {
            engine: LedgerReplayEngine::new(repo.clone(), prices.clone()),
            repo,
            prices,
        }
    }

    /// Stored history for the requested range, refreshed as needed.
    ///
    /// # Errors
    /// Unknown portfolio or an invalid range. Store and calculation failures
    /// degrade to an empty or stale response carrying `info` instead.
    pub async fn get_history(
        &self,
        request: &HistoryRequest,
    ) -> Result<HistoryResponse, ValuationError> {
        let portfolio = self
            .repo
            .get_portfolio(&request.portfolio)
            .await?
            .ok_or_else(|| {
                ReplayError::PortfolioNotFound(PortfolioId::new(request.portfolio.clone()))
            })?;
        if let (Some(from), Some(till)) = (request.from, request.till) {
            if from > till {
                return Err(ReplayError::InvalidRange { from, till }.into());
            }
        }
        let pid = portfolio.id;

        let metadata = match self.repo.coverage_metadata(&pid).await {
            Ok(metadata) => metadata,
            Err(e) => return Ok(HistoryResponse::degraded(&pid, "History store unavailable", &e)),
        };

        if metadata.total_records == 0 {
            info!(portfolio_id = %pid, "No stored history, calculating");
            return Ok(self.recalculated(&pid, request).await);
        }

        let now = TimeMs::now();
        let last_updated = metadata.last_updated.unwrap_or(TimeMs::new(0));
        let age_minutes = now.as_ms().saturating_sub(last_updated.as_ms()) / 60_000;
        let fresh = is_fresh(last_updated, now, request.max_age_minutes);

        if fresh && metadata.calculation_status != CalculationStatus::Outdated {
            let rows = match self.repo.query_snapshot_rows(&pid, None, None).await {
                Ok(rows) => rows,
                Err(e) => {
                    return Ok(HistoryResponse::degraded(&pid, "History store unavailable", &e))
                }
            };
            let records: Vec<_> = rows.iter().map(|r| r.to_record()).collect();
            if let Err(violation) = validate_integrity(&records) {
                warn!(
                    portfolio_id = %pid,
                    violation = %violation,
                    "Stored history failed integrity check, recalculating"
                );
                return Ok(self.recalculated(&pid, request).await);
            }
            return Ok(
                match self
                    .read_slice(&pid, request.from, request.till, request.precision)
                    .await
                {
                    Ok(snapshots) => HistoryResponse {
                        snapshots,
                        served_from_cache: true,
                        cache_age_minutes: Some(age_minutes),
                        metadata: Some(metadata),
                        info: None,
                        details: Vec::new(),
                    },
                    Err(e) => HistoryResponse::degraded(&pid, "History store unavailable", &e),
                },
            );
        }

        info!(
            portfolio_id = %pid,
            age_minutes,
            status = ?metadata.calculation_status,
            "Stored history stale, refreshing"
        );
        let refresh_error = match self.update_history(&pid, None).await {
            Ok(outcome) => return Ok(self.fresh_response(&pid, request, outcome).await),
            Err(e) => e,
        };
        warn!(portfolio_id = %pid, error = %refresh_error, "Refresh failed, serving stale history");
        Ok(
            match self
                .read_slice(&pid, request.from, request.till, request.precision)
                .await
            {
                Ok(snapshots) => HistoryResponse {
                    snapshots,
                    served_from_cache: true,
                    cache_age_minutes: Some(age_minutes),
                    metadata: Some(CoverageMetadata {
                        calculation_status: CalculationStatus::Outdated,
                        ..metadata
                    }),
                    info: Some(format!("Serving outdated history: {}", refresh_error)),
                    details: Vec::new(),
                },
                Err(e) => HistoryResponse::degraded(&pid, "History store unavailable", &e),
            },
        )
    }

    /// Recompute without touching the store: clears the price cache and the
    /// portfolio's stored history, then replays. Results are not persisted.
    ///
    /// # Errors
    /// Unknown portfolio, or any replay error.
    pub async fn refresh_uncached(
        &self,
        request: &HistoryRequest,
    ) -> Result<HistoryResponse, ValuationError> {
        let portfolio = self
            .repo
            .get_portfolio(&request.portfolio)
            .await?
            .ok_or_else(|| {
                ReplayError::PortfolioNotFound(PortfolioId::new(request.portfolio.clone()))
            })?;
        self.prices.clear();
        let deleted = self.repo.delete_history(&portfolio.id).await?;
        info!(portfolio_id = %portfolio.id, deleted, "Forced refresh");

        let result = self
            .engine
            .replay(
                portfolio.id.as_str(),
                request.from,
                request.till,
                request.precision,
            )
            .await?;
        Ok(HistoryResponse {
            snapshots: result.snapshots,
            served_from_cache: false,
            cache_age_minutes: None,
            metadata: None,
            info: interpolation_note(&result.symbols_without_price_data),
            details: result.details,
        })
    }

    /// Full recompute of a portfolio's history, persisted at stored precision.
    ///
    /// `from` is accepted for callers that track a last-calculated day; the
    /// whole ledger is replayed regardless. A portfolio without active trades
    /// gets a single zero snapshot dated today.
    ///
    /// # Errors
    /// Replay or store failure; nothing is partially written.
    pub async fn update_history(
        &self,
        portfolio_id: &PortfolioId,
        from: Option<NaiveDate>,
    ) -> Result<UpdateOutcome, ValuationError> {
        info!(portfolio_id = %portfolio_id, requested_from = ?from, "Updating history");

        match self
            .engine
            .replay(portfolio_id.as_str(), None, None, STORED_PRECISION)
            .await
        {
            Ok(result) => {
                let records_written = self
                    .repo
                    .replace_history(portfolio_id, &result.snapshots)
                    .await?;
                Ok(UpdateOutcome {
                    records_written,
                    symbols_without_price_data: result.symbols_without_price_data,
                    degraded_days: result.degraded_days.len(),
                    details: result.details,
                })
            }
            Err(ReplayError::EmptyLedger) => {
                let now = TimeMs::now();
                let today = chrono::Utc::now().date_naive();
                let baseline = ValuationSnapshot::baseline(portfolio_id.clone(), today, now);
                let records_written = self.repo.replace_history(portfolio_id, &[baseline]).await?;
                info!(portfolio_id = %portfolio_id, "No trades, stored baseline snapshot");
                Ok(UpdateOutcome {
                    records_written,
                    ..UpdateOutcome::default()
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Discard and rebuild a portfolio's stored history.
    ///
    /// # Errors
    /// Replay or store failure.
    pub async fn force_recalculate(
        &self,
        portfolio_id: &PortfolioId,
    ) -> Result<UpdateOutcome, ValuationError> {
        self.update_history(portfolio_id, None).await
    }

    /// Ledger changed: flag stored history so the next read recomputes it.
    ///
    /// # Errors
    /// Store failure.
    pub async fn invalidate(&self, portfolio_id: &PortfolioId) -> Result<u64, ValuationError> {
        let flagged = self.repo.mark_outdated(portfolio_id).await?;
        info!(portfolio_id = %portfolio_id, flagged, "History invalidated");
        Ok(flagged)
    }

    async fn recalculated(&self, pid: &PortfolioId, request: &HistoryRequest) -> HistoryResponse {
        match self.force_recalculate(pid).await {
            Ok(outcome) => self.fresh_response(pid, request, outcome).await,
            Err(e) => HistoryResponse::degraded(pid, "History calculation failed", &e),
        }
    }

    async fn read_slice(
        &self,
        pid: &PortfolioId,
        from: Option<NaiveDate>,
        till: Option<NaiveDate>,
        precision: u32,
    ) -> Result<Vec<ValuationSnapshot>, sqlx::Error> {
        Ok(self
            .repo
            .query_snapshots(pid, from, till)
            .await?
            .iter()
            .map(|s| s.rounded(precision))
            .collect())
    }

    async fn fresh_response(
        &self,
        pid: &PortfolioId,
        request: &HistoryRequest,
        outcome: UpdateOutcome,
    ) -> HistoryResponse {
        let snapshots = match self
            .read_slice(pid, request.from, request.till, request.precision)
            .await
        {
            Ok(snapshots) => snapshots,
            Err(e) => return HistoryResponse::degraded(pid, "History store unavailable", &e),
        };
        let metadata = self.repo.coverage_metadata(pid).await.ok();
        HistoryResponse {
            snapshots,
            served_from_cache: false,
            cache_age_minutes: None,
            metadata,
            info: interpolation_note(&outcome.symbols_without_price_data),
            details: details_in_range(
                &outcome.details,
                request.from,
                request.till,
                request.precision,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::MockMarketData;
    use crate::db::repo::test_support::{execute, portfolio, setup_test_db};
    use crate::domain::trade::fixtures::{d, trade};
    use crate::domain::{Decimal, Side, TradeKind};
    use crate::pricing::{FetchSettings, InMemoryPriceRateCache, PriceLookup};
    use std::time::Duration;

    #[test]
    fn test_is_fresh_boundaries() {
        let now = TimeMs::new(10 * 60_000);
        assert!(is_fresh(TimeMs::new(now.as_ms() - 1), now, 1));
        assert!(!is_fresh(TimeMs::new(now.as_ms() - 60_000), now, 1));
        assert!(!is_fresh(now, now, 0));
        assert!(is_fresh(TimeMs::new(0), now, i64::MAX));
    }

    async fn cache_with_trade() -> (ValuationCache, Arc<Repository>, tempfile::TempDir) {
        let (repo, dir) = setup_test_db().await;
        repo.upsert_portfolio(&portfolio("p1", "USD")).await.unwrap();
        let today = chrono::Utc::now().date_naive();
        let start = today - chrono::Duration::days(3);
        let buy = trade(
            TradeKind::Trade,
            Side::Buy,
            "XYZ",
            &crate::domain::format_day(start),
        );
        repo.insert_trade(&buy).await.unwrap();
        let repo = Arc::new(repo);
        let mock = MockMarketData::new().with_price("XYZ", start, d("100"));
        let prices = Arc::new(InMemoryPriceRateCache::new(
            Arc::new(mock),
            FetchSettings {
                batch_size: 10,
                batch_delay: Duration::from_millis(1),
            },
        ));
        (ValuationCache::new(repo.clone(), prices), repo, dir)
    }

    fn request(max_age_minutes: i64) -> HistoryRequest {
        HistoryRequest {
            portfolio: "p1".to_string(),
            from: None,
            till: None,
            precision: 2,
            max_age_minutes,
        }
    }

    #[tokio::test]
    async fn test_first_request_calculates_then_serves_cache() {
        let (cache, repo, _dir) = cache_with_trade().await;

        let first = cache.get_history(&request(i64::MAX)).await.unwrap();
        assert!(!first.served_from_cache);
        assert_eq!(first.snapshots.len(), 4);

        let second = cache.get_history(&request(i64::MAX)).await.unwrap();
        assert!(second.served_from_cache);
        assert_eq!(second.snapshots, first.snapshots);
        assert_eq!(
            repo.coverage_metadata(&PortfolioId::new("p1"))
                .await
                .unwrap()
                .calculation_status,
            CalculationStatus::Complete
        );
    }

    const FAILING_WRITES: &str = "CREATE TRIGGER full_disk BEFORE INSERT ON valuation_snapshots \
         BEGIN SELECT RAISE(ABORT, 'disk full'); END";
    const FAILING_UPDATES: &str = "CREATE TRIGGER full_disk_update BEFORE UPDATE ON valuation_snapshots \
         BEGIN SELECT RAISE(ABORT, 'disk full'); END";

    #[tokio::test]
    async fn test_failed_first_calculation_degrades_to_empty_response() {
        let (cache, repo, _dir) = cache_with_trade().await;
        execute(&repo, FAILING_WRITES).await;

        let response = cache.get_history(&request(i64::MAX)).await.unwrap();
        assert!(response.snapshots.is_empty());
        assert!(!response.served_from_cache);
        let info = response.info.unwrap();
        assert!(info.starts_with("History calculation failed"));
        assert!(info.contains("disk full"));
    }

    #[tokio::test]
    async fn test_unreadable_store_degrades_to_empty_response() {
        let (cache, repo, _dir) = cache_with_trade().await;
        execute(&repo, "DROP TABLE valuation_snapshots").await;

        let response = cache.get_history(&request(i64::MAX)).await.unwrap();
        assert!(response.snapshots.is_empty());
        assert!(response.metadata.is_none());
        assert!(response.info.unwrap().starts_with("History store unavailable"));
    }

    #[tokio::test]
    async fn test_failed_refresh_serves_stale_history_as_outdated() {
        let (cache, repo, _dir) = cache_with_trade().await;
        let stored = cache.get_history(&request(i64::MAX)).await.unwrap();
        execute(&repo, FAILING_WRITES).await;
        execute(&repo, FAILING_UPDATES).await;

        let stale = cache.get_history(&request(0)).await.unwrap();
        assert!(stale.served_from_cache);
        assert_eq!(stale.snapshots, stored.snapshots);
        assert!(stale.details.is_empty());
        assert_eq!(
            stale.metadata.unwrap().calculation_status,
            CalculationStatus::Outdated
        );
        let info = stale.info.unwrap();
        assert!(info.starts_with("Serving outdated history"));
        assert!(info.contains("disk full"));
    }

    #[tokio::test]
    async fn test_details_only_on_computed_responses() {
        let (cache, _repo, _dir) = cache_with_trade().await;

        let computed = cache.get_history(&request(i64::MAX)).await.unwrap();
        assert_eq!(computed.details.len(), 1);
        assert_eq!(computed.details[0].symbol, Some(Symbol::new("XYZ")));
        assert_eq!(computed.details[0].cash, d("-1000"));
        assert_eq!(computed.details[0].new_volume, Some(d("10")));

        let cached = cache.get_history(&request(i64::MAX)).await.unwrap();
        assert!(cached.served_from_cache);
        assert!(cached.details.is_empty());

        let mut later = request(i64::MAX);
        later.from = Some(chrono::Utc::now().date_naive());
        let forced = cache.refresh_uncached(&later).await.unwrap();
        assert!(forced.details.is_empty());
        assert_eq!(cache.refresh_uncached(&request(0)).await.unwrap().details.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_max_age_always_recomputes() {
        let (cache, _repo, _dir) = cache_with_trade().await;
        cache.get_history(&request(0)).await.unwrap();
        let again = cache.get_history(&request(0)).await.unwrap();
        assert!(!again.served_from_cache);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let (cache, _repo, _dir) = cache_with_trade().await;
        cache.get_history(&request(i64::MAX)).await.unwrap();
        assert_eq!(cache.invalidate(&PortfolioId::new("p1")).await.unwrap(), 4);

        let after = cache.get_history(&request(i64::MAX)).await.unwrap();
        assert!(!after.served_from_cache);
        assert_eq!(
            after.metadata.unwrap().calculation_status,
            CalculationStatus::Complete
        );
    }

    #[tokio::test]
    async fn test_corrupt_history_is_recalculated() {
        let (cache, repo, _dir) = cache_with_trade().await;
        cache.get_history(&request(i64::MAX)).await.unwrap();

        let pid = PortfolioId::new("p1");
        let mut stored = repo.query_snapshots(&pid, None, None).await.unwrap();
        let last = stored.len() - 1;
        stored[last].nav = d("-50000");
        repo.upsert_snapshots(&stored[last..]).await.unwrap();

        let healed = cache.get_history(&request(i64::MAX)).await.unwrap();
        assert!(!healed.served_from_cache);
        let last = healed.snapshots.last().unwrap();
        assert_eq!(last.nav, last.invested_value + last.cash);
    }

    #[tokio::test]
    async fn test_refresh_uncached_does_not_persist() {
        let (cache, repo, _dir) = cache_with_trade().await;
        cache.get_history(&request(i64::MAX)).await.unwrap();

        let response = cache.refresh_uncached(&request(i64::MAX)).await.unwrap();
        assert!(!response.served_from_cache);
        assert_eq!(response.snapshots.len(), 4);
        let meta = repo.coverage_metadata(&PortfolioId::new("p1")).await.unwrap();
        assert_eq!(meta.total_records, 0);
    }

    #[tokio::test]
    async fn test_refresh_uncached_unknown_portfolio_keeps_price_cache() {
        let (repo, _dir) = setup_test_db().await;
        repo.upsert_portfolio(&portfolio("p1", "USD")).await.unwrap();
        let mock = MockMarketData::new().with_price("XYZ", d_day("2024-01-10"), d("100"));
        let prices = Arc::new(InMemoryPriceRateCache::new(
            Arc::new(mock.clone()),
            FetchSettings::default(),
        ));
        let xyz = [Symbol::new("XYZ")];
        prices.ensure_prices(&xyz, d_day("2024-01-01")).await;
        let cache = ValuationCache::new(Arc::new(repo), prices.clone());

        let mut req = request(0);
        req.portfolio = "ghost".to_string();
        assert!(matches!(
            cache.refresh_uncached(&req).await,
            Err(ValuationError::Replay(ReplayError::PortfolioNotFound(_)))
        ));

        prices.ensure_prices(&xyz, d_day("2024-01-01")).await;
        assert_eq!(mock.call_count(), 1);
        assert_eq!(prices.lookup_price(d_day("2024-01-10"), &xyz[0]), Some(d("100")));
    }

    fn d_day(s: &str) -> NaiveDate {
        crate::domain::parse_day(s).unwrap()
    }

    #[tokio::test]
    async fn test_update_history_without_trades_stores_baseline() {
        let (repo, _dir) = setup_test_db().await;
        repo.upsert_portfolio(&portfolio("p0", "USD")).await.unwrap();
        let repo = Arc::new(repo);
        let prices = Arc::new(InMemoryPriceRateCache::new(
            Arc::new(MockMarketData::new()),
            FetchSettings::default(),
        ));
        let cache = ValuationCache::new(repo.clone(), prices);

        let pid = PortfolioId::new("p0");
        let outcome = cache.update_history(&pid, None).await.unwrap();
        assert_eq!(outcome.records_written, 1);
        let stored = repo.query_snapshots(&pid, None, None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].nav, Decimal::zero());
        assert_eq!(stored[0].share_count, Decimal::one());
        assert_eq!(stored[0].date, chrono::Utc::now().date_naive());
    }

    #[tokio::test]
    async fn test_unknown_portfolio_and_bad_range() {
        let (cache, _repo, _dir) = cache_with_trade().await;
        let mut req = request(10);
        req.portfolio = "ghost".to_string();
        assert!(matches!(
            cache.get_history(&req).await,
            Err(ValuationError::Replay(ReplayError::PortfolioNotFound(_)))
        ));

        let mut req = request(10);
        req.from = crate::domain::parse_day("2024-02-01");
        req.till = crate::domain::parse_day("2024-01-01");
        assert!(matches!(
            cache.get_history(&req).await,
            Err(ValuationError::Replay(ReplayError::InvalidRange { .. }))
        ));
    }
}
