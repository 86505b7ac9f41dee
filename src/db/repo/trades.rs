//! Trade ledger operations for the repository.

use crate::domain::{
    format_day, Currency, Decimal, PortfolioId, Symbol, Trade, TradeState,
};
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::warn;
use uuid::Uuid;

use super::Repository;

/// Stored `trade_time` layout; sorts lexicographically in time order.
const TRADE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

impl Repository {
    /// Append a trade to the ledger. A trade without an id gets a fresh UUID.
    ///
    /// Returns the stored trade id.
    ///
    /// # Errors
    /// Returns an error if the insert fails (e.g. duplicate id, unknown portfolio).
    pub async fn insert_trade(&self, trade: &Trade) -> Result<String, sqlx::Error> {
        let id = if trade.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            trade.id.clone()
        };

        sqlx::query(
            r#"
            INSERT INTO trades (
                id, portfolio_id, kind, side, symbol, currency, price, volume,
                fee, rate, shares, trade_time, state, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(trade.portfolio_id.as_str())
        .bind(trade.kind.as_str())
        .bind(trade.side.as_str())
        .bind(trade.symbol.as_str())
        .bind(trade.currency.as_str())
        .bind(trade.price.to_canonical_string())
        .bind(trade.volume.to_canonical_string())
        .bind(trade.fee.to_canonical_string())
        .bind(trade.rate.to_canonical_string())
        .bind(trade.shares.map(|s| s.to_canonical_string()))
        .bind(trade.trade_time.format(TRADE_TIME_FORMAT).to_string())
        .bind(trade.state.as_str())
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Change a trade's state. Returns false if the trade does not exist.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn set_trade_state(&self, id: &str, state: TradeState) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE trades SET state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// List a portfolio's trades ordered by trade time, ties in insertion order.
    ///
    /// # Arguments
    /// * `portfolio_id` - Portfolio whose ledger is read
    /// * `active_only` - Only trades in the active state
    /// * `till` - Last calendar day included (inclusive); `None` for all
    ///
    /// Rows that cannot be parsed are logged and skipped.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_trades(
        &self,
        portfolio_id: &PortfolioId,
        active_only: bool,
        till: Option<NaiveDate>,
    ) -> Result<Vec<Trade>, sqlx::Error> {
        // Any trade_time on `till` sorts before the next day's bare date.
        let before = till
            .and_then(|d| d.succ_opt())
            .map(format_day)
            .unwrap_or_else(|| "9999-12-31".to_string());

        let rows = sqlx::query(
            r#"
            SELECT id, portfolio_id, kind, side, symbol, currency, price, volume,
                   fee, rate, shares, trade_time, state
            FROM trades
            WHERE portfolio_id = ? AND trade_time < ? AND (? = 0 OR state = ?)
            ORDER BY trade_time ASC, seq ASC
            "#,
        )
        .bind(portfolio_id.as_str())
        .bind(before)
        .bind(active_only as i32)
        .bind(TradeState::Active.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| match trade_from_row(row) {
                Ok(trade) => Some(trade),
                Err(reason) => {
                    warn!(
                        trade_id = %row.get::<String, _>("id"),
                        reason = %reason,
                        "Skipping unreadable trade row"
                    );
                    None
                }
            })
            .collect())
    }
}

fn trade_from_row(row: &SqliteRow) -> Result<Trade, String> {
    let decimal = |column: &str| -> Result<Decimal, String> {
        let raw: String = row.get(column);
        Decimal::from_str_canonical(&raw).map_err(|e| format!("{}: {}", column, e))
    };
    let shares = row
        .get::<Option<String>, _>("shares")
        .map(|raw| Decimal::from_str_canonical(&raw).map_err(|e| format!("shares: {}", e)))
        .transpose()?;
    let trade_time_raw: String = row.get("trade_time");
    let trade_time = NaiveDateTime::parse_from_str(&trade_time_raw, TRADE_TIME_FORMAT)
        .map_err(|e| format!("trade_time: {}", e))?;

    Ok(Trade {
        id: row.get("id"),
        portfolio_id: PortfolioId::new(row.get::<String, _>("portfolio_id")),
        kind: row
            .get::<String, _>("kind")
            .parse()
            .map_err(|e| format!("{}", e))?,
        side: row
            .get::<String, _>("side")
            .parse()
            .map_err(|e| format!("{}", e))?,
        symbol: Symbol::new(row.get::<String, _>("symbol")),
        currency: Currency::new(row.get::<String, _>("currency")),
        price: decimal("price")?,
        volume: decimal("volume")?,
        fee: decimal("fee")?,
        rate: decimal("rate")?,
        shares,
        trade_time,
        state: row
            .get::<String, _>("state")
            .parse()
            .map_err(|e| format!("{}", e))?,
    })
}
