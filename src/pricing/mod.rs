//! Date-indexed price and FX-rate cache with nearest-prior-date fallback.
//!
//! The replay engine only needs the synchronous [`PriceLookup`] view; the
//! orchestration layer drives population through [`PriceRateCache`].

use crate::domain::{Currency, Decimal, Symbol, Trade};
use async_trait::async_trait;
use chrono::NaiveDate;

pub mod cache;
pub mod interpolate;

pub use cache::{FetchSettings, InMemoryPriceRateCache};

/// Calendar days searched backwards when the exact date is missing.
pub const SEARCH_WINDOW_DAYS: i64 = 10;

/// Decimal places kept on returned FX rates.
pub const RATE_PRECISION: u32 = 4;

/// Read-only price/rate resolution used during replay.
pub trait PriceLookup: Send + Sync {
    /// Close for `symbol` on `date`, or the nearest earlier close within the search window.
    fn lookup_price(&self, date: NaiveDate, symbol: &Symbol) -> Option<Decimal>;

    /// Units of `to` per unit of `from` on `date` (nearest earlier within the
    /// window), rounded to [`RATE_PRECISION`]. Equal currencies yield 1; a
    /// rate known only for the reverse pair is inverted. `None` means unknown.
    fn lookup_rate(&self, from: &Currency, to: &Currency, date: NaiveDate) -> Option<Decimal>;

    /// Convert `price` from `currency` into `base`; `None` if no rate resolves.
    fn price_to_base_currency(
        &self,
        price: Decimal,
        date: NaiveDate,
        currency: &Currency,
        base: &Currency,
    ) -> Option<Decimal> {
        if currency == base {
            return Some(price);
        }
        self.lookup_rate(currency, base, date)
            .and_then(|rate| price.checked_mul(rate))
    }
}

/// Process-wide cache service populated on demand from a market-data provider.
///
/// Provider failures never surface as errors: they are logged and reported
/// back as symbols/pairs without data.
#[async_trait]
pub trait PriceRateCache: PriceLookup {
    /// Make sure every symbol has history from `from` onwards.
    ///
    /// Returns the symbols for which the provider has no data.
    async fn ensure_prices(&self, symbols: &[Symbol], from: NaiveDate) -> Vec<Symbol>;

    /// Make sure a rate between `a` and `b` is available from `from` onwards.
    ///
    /// Returns the pair symbol (`AB`) when neither direction can be resolved.
    async fn ensure_rate(&self, a: &Currency, b: &Currency, from: NaiveDate) -> Option<String>;

    /// Interpolate prices for `symbols` and rates for `pairs` from the trades'
    /// own recorded prices and rates, up to `end`. Also seeds the trade price
    /// on any trade date where the symbol's price is otherwise unresolvable.
    /// Existing cache entries are never overwritten.
    fn fill_from_trades(
        &self,
        trades: &[Trade],
        symbols: &[Symbol],
        pairs: &[(Currency, Currency)],
        end: NaiveDate,
    );

    /// Drop every cached price, rate and coverage marker.
    fn clear(&self);
}
