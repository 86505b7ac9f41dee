//! Repository layer for database operations.
//!
//! This module provides the `Repository` struct for all database operations.
//! Methods are organized across submodules by domain:
//! - `trades.rs` - Trade ledger operations
//! - `snapshots.rs` - Valuation snapshot store, coverage and retention

mod snapshots;
mod trades;

pub use snapshots::{PortfolioDataReport, RetentionStats, SnapshotRow};

use crate::domain::{Currency, Portfolio, PortfolioId, Symbol};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

/// Repository for database operations.
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }

    /// Round-trip a trivial query to check the pool is usable.
    ///
    /// # Errors
    /// Returns an error if the database cannot be reached.
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // =========================================================================
    // Portfolio operations
    // =========================================================================

    /// Insert or update a portfolio.
    ///
    /// # Errors
    /// Returns an error if the upsert fails.
    pub async fn upsert_portfolio(&self, portfolio: &Portfolio) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO portfolios (id, name, currency, base_instrument, created_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                currency = excluded.currency,
                base_instrument = excluded.base_instrument,
                created_by = excluded.created_by
            "#,
        )
        .bind(portfolio.id.as_str())
        .bind(&portfolio.name)
        .bind(portfolio.currency.as_str())
        .bind(portfolio.base_instrument.as_ref().map(|s| s.as_str()))
        .bind(portfolio.created_by.as_deref())
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Look a portfolio up by id, falling back to its name.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_portfolio(&self, id_or_name: &str) -> Result<Option<Portfolio>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT id, name, currency, base_instrument, created_by
            FROM portfolios
            WHERE id = ? OR name = ?
            ORDER BY CASE WHEN id = ? THEN 0 ELSE 1 END, created_at ASC
            LIMIT 1
            "#,
        )
        .bind(id_or_name)
        .bind(id_or_name)
        .bind(id_or_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Portfolio {
            id: PortfolioId::new(row.get::<String, _>("id")),
            name: row.get("name"),
            currency: Currency::new(row.get::<String, _>("currency")),
            base_instrument: row
                .get::<Option<String>, _>("base_instrument")
                .filter(|s| !s.is_empty())
                .map(Symbol::new),
            created_by: row.get("created_by"),
        }))
    }
}
