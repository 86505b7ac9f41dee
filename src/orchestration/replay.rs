//! Loads a portfolio's ledger, makes prices and rates available, and runs
//! the pure day-by-day replay.

use crate::db::Repository;
use crate::domain::{
    days_before, Currency, Portfolio, PortfolioId, Symbol, TimeMs, Trade, TradeKind,
    ValuationSnapshot,
};
use crate::engine::{replay_days, DegradedDay, ReplayInput, TradeDetail};
use crate::pricing::{PriceRateCache, SEARCH_WINDOW_DAYS};
use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("portfolio {0} not found")]
    PortfolioNotFound(PortfolioId),
    #[error("no trades and no start date")]
    EmptyLedger,
    #[error("from {from} is after till {till}")]
    InvalidRange { from: NaiveDate, till: NaiveDate },
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct ReplayResult {
    pub portfolio: Portfolio,
    pub from: NaiveDate,
    pub till: NaiveDate,
    pub snapshots: Vec<ValuationSnapshot>,
    /// Symbols whose prices had to be reconstructed from trade prices.
    pub symbols_without_price_data: Vec<Symbol>,
    /// Currency pairs with no provider history in either direction.
    pub unresolved_pairs: Vec<String>,
    pub degraded_days: Vec<DegradedDay>,
    /// Trades applied within `[from, till]`, cash rounded like the snapshots.
    pub details: Vec<TradeDetail>,
}

#[derive(Clone)]
pub struct LedgerReplayEngine {
    repo: Arc<Repository>,
    prices: Arc<dyn PriceRateCache>,
}

impl LedgerReplayEngine {
    pub fn new(repo: Arc<Repository>, prices: Arc<dyn PriceRateCache>) -> Self {
        Self { repo, prices }
    }

    /// Replay a portfolio over `[from, till]`, one snapshot per calendar day.
    ///
    /// `till` defaults to today (UTC). `from` defaults to the first trade's
    /// date and is clamped forward to it. Values are rounded to `precision`.
    ///
    /// # Errors
    /// Unknown portfolio, empty ledger without `from`, `from > till`, or a
    /// ledger read failure. Missing prices are never an error.
    pub async fn replay(
        &self,
        portfolio: &str,
        from: Option<NaiveDate>,
        till: Option<NaiveDate>,
        precision: u32,
    ) -> Result<ReplayResult, ReplayError> {
        let portfolio = self
            .repo
            .get_portfolio(portfolio)
            .await?
            .ok_or_else(|| ReplayError::PortfolioNotFound(PortfolioId::new(portfolio)))?;

        let till = till.unwrap_or_else(|| chrono::Utc::now().date_naive());
        let trades = self.repo.list_trades(&portfolio.id, true, Some(till)).await?;

        let first_trade = trades.first().map(Trade::trade_date);
        let from = match (from, first_trade) {
            (Some(from), Some(first)) => from.max(first),
            (Some(from), None) => from,
            (None, Some(first)) => first,
            (None, None) => return Err(ReplayError::EmptyLedger),
        };
        if from > till {
            return Err(ReplayError::InvalidRange { from, till });
        }

        let (symbols_without_price_data, unresolved_pairs) =
            self.ensure_market_data(&portfolio, &trades, from, till).await;

        let now = TimeMs::now();
        let input = ReplayInput {
            portfolio_id: &portfolio.id,
            currency: &portfolio.currency,
            base_instrument: portfolio.base_instrument.as_ref(),
            trades: &trades,
            from,
            till,
            now,
        };
        let output = replay_days(&input, self.prices.as_ref());

        info!(
            portfolio_id = %portfolio.id,
            from = %from,
            till = %till,
            trades = trades.len(),
            days = output.snapshots.len(),
            degraded = output.degraded_days.len(),
            unvalued = output.unvalued.len(),
            "Ledger replayed"
        );

        Ok(ReplayResult {
            snapshots: output
                .snapshots
                .iter()
                .map(|s| s.rounded(precision))
                .collect(),
            portfolio,
            from,
            till,
            symbols_without_price_data,
            unresolved_pairs,
            degraded_days: output.degraded_days,
            details: output
                .details
                .iter()
                .map(|t| t.rounded(precision))
                .collect(),
        })
    }

    /// Fetch prices for every traded symbol (and the benchmark) and rates for
    /// every trade currency, starting a search window before `from`, then
    /// reconstruct what the provider lacks from the trades themselves.
    async fn ensure_market_data(
        &self,
        portfolio: &Portfolio,
        trades: &[Trade],
        from: NaiveDate,
        till: NaiveDate,
    ) -> (Vec<Symbol>, Vec<String>) {
        let fetch_from = days_before(from, SEARCH_WINDOW_DAYS);

        let traded: BTreeSet<Symbol> = trades
            .iter()
            .filter(|t| t.kind == TradeKind::Trade && !t.symbol.as_str().is_empty())
            .map(|t| t.symbol.clone())
            .collect();
        let mut symbols: Vec<Symbol> = traded.iter().cloned().collect();
        if let Some(benchmark) = &portfolio.base_instrument {
            if !traded.contains(benchmark) {
                symbols.push(benchmark.clone());
            }
        }
        let missing = self.prices.ensure_prices(&symbols, fetch_from).await;

        let currencies: BTreeSet<&Currency> = trades
            .iter()
            .map(|t| &t.currency)
            .filter(|c| **c != portfolio.currency)
            .collect();
        let mut unresolved: Vec<(Currency, Currency)> = Vec::new();
        for currency in currencies {
            if self
                .prices
                .ensure_rate(currency, &portfolio.currency, fetch_from)
                .await
                .is_some()
            {
                unresolved.push((currency.clone(), portfolio.currency.clone()));
            }
        }

        let missing_traded: Vec<Symbol> = missing
            .into_iter()
            .filter(|s| {
                let is_traded = traded.contains(s);
                if !is_traded {
                    warn!(portfolio_id = %portfolio.id, symbol = %s, "No benchmark prices");
                }
                is_traded
            })
            .collect();
        self.prices
            .fill_from_trades(trades, &missing_traded, &unresolved, till);

        let pairs = unresolved.iter().map(|(a, b)| a.pair_with(b)).collect();
        (missing_traded, pairs)
    }
}
