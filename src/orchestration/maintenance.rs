//! Periodic upkeep of the snapshot store: recompute stale or flagged
//! portfolios, then drop snapshots older than the retention horizon.

use crate::db::{Repository, RetentionStats};
use crate::domain::{PortfolioId, TimeMs};
use chrono::{Months, NaiveDate};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::valuation_cache::{ValuationCache, ValuationError};

#[derive(Debug, Clone)]
pub struct MaintenanceSettings {
    pub stale_after_minutes: i64,
    pub retention_years: u32,
    /// Portfolios recomputed concurrently per chunk.
    pub concurrency: usize,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            stale_after_minutes: 1440,
            retention_years: 5,
            concurrency: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceStats {
    pub processed: usize,
    pub failed: usize,
    pub records_updated: usize,
    pub retention: RetentionStats,
}

#[derive(Clone)]
pub struct Maintenance {
    repo: Arc<Repository>,
    cache: Arc<ValuationCache>,
    settings: MaintenanceSettings,
}

/// First day kept when retaining `years` of history before `today`.
pub fn retention_cutoff(today: NaiveDate, years: u32) -> NaiveDate {
    today
        .checked_sub_months(Months::new(years.saturating_mul(12)))
        .unwrap_or(NaiveDate::MIN)
}

impl Maintenance {
    pub fn new(
        repo: Arc<Repository>,
        cache: Arc<ValuationCache>,
        settings: MaintenanceSettings,
    ) -> Self {
        Self {
            repo,
            cache,
            settings,
        }
    }

    /// One maintenance pass. Per-portfolio failures are counted, not raised.
    ///
    /// # Errors
    /// Only if the store cannot list candidates or apply retention.
    pub async fn run_once(&self) -> Result<MaintenanceStats, sqlx::Error> {
        let stale_before = TimeMs::new(
            TimeMs::now()
                .as_ms()
                .saturating_sub(self.settings.stale_after_minutes.saturating_mul(60_000)),
        );
        let candidates = self.repo.portfolios_needing_update(stale_before).await?;
        info!(count = candidates.len(), "Portfolios needing history update");

        let mut stats = MaintenanceStats::default();
        for chunk in candidates.chunks(self.settings.concurrency.max(1)) {
            let results = join_all(chunk.iter().map(|pid| self.update_one(pid))).await;
            for (pid, result) in chunk.iter().zip(results) {
                stats.processed += 1;
                match result {
                    Ok(written) => stats.records_updated += written,
                    Err(e) => {
                        stats.failed += 1;
                        warn!(portfolio_id = %pid, error = %e, "History update failed");
                    }
                }
            }
        }

        let cutoff = retention_cutoff(chrono::Utc::now().date_naive(), self.settings.retention_years);
        stats.retention = self.repo.delete_snapshots_before(cutoff).await?;

        info!(
            processed = stats.processed,
            failed = stats.failed,
            records_updated = stats.records_updated,
            deleted = stats.retention.deleted_records,
            "Maintenance pass complete"
        );
        Ok(stats)
    }

    async fn update_one(&self, pid: &PortfolioId) -> Result<usize, ValuationError> {
        Ok(self.cache.update_history(pid, None).await?.records_written)
    }

    /// Run passes every `period` until the task is dropped.
    pub async fn run_periodically(self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once().await {
                error!(error = %e, "Maintenance pass failed");
            }
        }
    }
}
