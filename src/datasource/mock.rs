//! Mock market-data provider for testing without network calls.

use super::{DataSourceError, MarketDataProvider, PricePoint};
use crate::domain::Decimal;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Mock provider returning predefined histories and counting requests.
#[derive(Debug, Clone, Default)]
pub struct MockMarketData {
    prices: HashMap<String, Vec<PricePoint>>,
    fx: HashMap<String, Vec<PricePoint>>,
    failing: HashSet<String>,
    /// Pairs that only answer full-history requests (no `from` filter).
    full_history_only: HashSet<String>,
    calls: Arc<AtomicUsize>,
}

impl MockMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a daily close for an instrument.
    pub fn with_price(mut self, symbol: &str, date: NaiveDate, close: Decimal) -> Self {
        self.prices
            .entry(symbol.to_string())
            .or_default()
            .push(PricePoint::new(date, close));
        self
    }

    /// Add a daily close for a currency pair (e.g. `EURUSD`).
    pub fn with_fx(mut self, pair: &str, date: NaiveDate, rate: Decimal) -> Self {
        self.fx
            .entry(pair.to_string())
            .or_default()
            .push(PricePoint::new(date, rate));
        self
    }

    /// Make every request for this symbol or pair fail.
    pub fn with_failure(mut self, symbol: &str) -> Self {
        self.failing.insert(symbol.to_string());
        self
    }

    /// Make date-filtered requests for this pair return nothing.
    pub fn with_full_history_only(mut self, pair: &str) -> Self {
        self.full_history_only.insert(pair.to_string());
        self
    }

    /// Number of fetches served so far (including failed ones).
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn lookup(
        &self,
        source: &HashMap<String, Vec<PricePoint>>,
        key: &str,
        from: Option<NaiveDate>,
    ) -> Result<Vec<PricePoint>, DataSourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(key) {
            return Err(DataSourceError::HttpError {
                status: 503,
                message: format!("{} unavailable", key),
            });
        }
        if from.is_some() && self.full_history_only.contains(key) {
            return Ok(Vec::new());
        }
        let mut points: Vec<PricePoint> = source
            .get(key)
            .map(|points| {
                points
                    .iter()
                    .filter(|p| from.map_or(true, |from| p.date >= from))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        points.sort_by_key(|p| p.date);
        Ok(points)
    }
}

#[async_trait]
impl MarketDataProvider for MockMarketData {
    async fn fetch_price_history(
        &self,
        symbol: &str,
        from: Option<NaiveDate>,
    ) -> Result<Vec<PricePoint>, DataSourceError> {
        self.lookup(&self.prices, symbol, from)
    }

    async fn fetch_fx_history(
        &self,
        pair: &str,
        from: Option<NaiveDate>,
    ) -> Result<Vec<PricePoint>, DataSourceError> {
        self.lookup(&self.fx, pair, from)
    }
}
