//! In-memory `PriceRateCache` backed by a market-data provider.

use super::interpolate::{daily_series, observations};
use super::{PriceLookup, PriceRateCache, RATE_PRECISION, SEARCH_WINDOW_DAYS};
use crate::datasource::{MarketDataProvider, PricePoint};
use crate::domain::{days_before, Currency, Decimal, Symbol, Trade, TradeKind};
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

type Series = BTreeMap<NaiveDate, Decimal>;

/// Provider throttling: `batch_size` concurrent fetches, then `batch_delay`.
#[derive(Debug, Clone, Copy)]
pub struct FetchSettings {
    pub batch_size: usize,
    pub batch_delay: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    prices: HashMap<Symbol, Series>,
    rates: HashMap<String, Series>,
    /// Earliest `from` already requested per symbol / pair.
    price_coverage: HashMap<Symbol, NaiveDate>,
    rate_coverage: HashMap<String, NaiveDate>,
    /// Symbols the provider returned nothing for, or whose last fetch failed.
    symbols_without_data: HashSet<Symbol>,
    unresolved_pairs: HashSet<String>,
}

#[derive(Debug)]
pub struct InMemoryPriceRateCache {
    provider: Arc<dyn MarketDataProvider>,
    settings: FetchSettings,
    state: RwLock<CacheState>,
}

impl InMemoryPriceRateCache {
    pub fn new(provider: Arc<dyn MarketDataProvider>, settings: FetchSettings) -> Self {
        Self {
            provider,
            settings,
            state: RwLock::new(CacheState::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a single close, keeping any value already present.
    pub fn insert_price(&self, symbol: &Symbol, date: NaiveDate, close: Decimal) {
        self.write()
            .prices
            .entry(symbol.clone())
            .or_default()
            .entry(date)
            .or_insert(close);
    }

    fn symbols_to_fetch(&self, symbols: &[Symbol], from: NaiveDate) -> Vec<Symbol> {
        let state = self.read();
        let mut seen = HashSet::new();
        symbols
            .iter()
            .filter(|s| seen.insert((*s).clone()))
            .filter(|s| state.price_coverage.get(*s).map_or(true, |c| *c > from))
            .cloned()
            .collect()
    }

    fn store_prices(&self, symbol: &Symbol, from: NaiveDate, points: Vec<PricePoint>) {
        let mut state = self.write();
        if points.is_empty() {
            state.symbols_without_data.insert(symbol.clone());
        } else {
            state.symbols_without_data.remove(symbol);
            let series = state.prices.entry(symbol.clone()).or_default();
            for point in points {
                series.insert(point.date, point.close);
            }
        }
        let coverage = state.price_coverage.entry(symbol.clone()).or_insert(from);
        if from < *coverage {
            *coverage = from;
        }
    }

    /// Pair already covered from `from`, or `None` if a fetch is needed.
    fn covered_pair(&self, ab: &str, ba: &str, from: NaiveDate) -> Option<String> {
        let state = self.read();
        [ab, ba]
            .into_iter()
            .find(|pair| {
                state.rates.contains_key(*pair)
                    && state.rate_coverage.get(*pair).map_or(false, |c| *c <= from)
            })
            .map(str::to_string)
    }

    /// Fetch order: whichever direction already has data, then the other one.
    fn pair_candidates(&self, ab: &str, ba: &str) -> [String; 2] {
        let state = self.read();
        if !state.rates.contains_key(ab) && state.rates.contains_key(ba) {
            [ba.to_string(), ab.to_string()]
        } else {
            [ab.to_string(), ba.to_string()]
        }
    }

    fn store_rates(&self, pair: &str, from: NaiveDate, points: Vec<PricePoint>) {
        let mut state = self.write();
        state.unresolved_pairs.remove(pair);
        let series = state.rates.entry(pair.to_string()).or_default();
        for point in points {
            series.insert(point.date, point.close);
        }
        let coverage = state.rate_coverage.entry(pair.to_string()).or_insert(from);
        if from < *coverage {
            *coverage = from;
        }
    }

    /// Date-filtered fetch, falling back to the full history when it comes back empty.
    async fn fetch_pair(&self, pair: &str, from: NaiveDate) -> Vec<PricePoint> {
        match self.provider.fetch_fx_history(pair, Some(from)).await {
            Ok(points) if !points.is_empty() => return points,
            Ok(_) => debug!(pair, from = %from, "No rates from start date, requesting full history"),
            Err(e) => warn!(pair, error = %e, "Rate fetch failed"),
        }
        match self.provider.fetch_fx_history(pair, None).await {
            Ok(points) => points,
            Err(e) => {
                warn!(pair, error = %e, "Full-history rate fetch failed");
                Vec::new()
            }
        }
    }
}

/// Nearest value on or before `date`, no further back than the search window.
fn nearest_prior(series: &Series, date: NaiveDate) -> Option<Decimal> {
    let earliest = days_before(date, SEARCH_WINDOW_DAYS);
    series.range(earliest..=date).next_back().map(|(_, v)| *v)
}

impl PriceLookup for InMemoryPriceRateCache {
    fn lookup_price(&self, date: NaiveDate, symbol: &Symbol) -> Option<Decimal> {
        let state = self.read();
        state.prices.get(symbol).and_then(|s| nearest_prior(s, date))
    }

    fn lookup_rate(&self, from: &Currency, to: &Currency, date: NaiveDate) -> Option<Decimal> {
        if from == to {
            return Some(Decimal::one());
        }
        let state = self.read();
        let direct = state
            .rates
            .get(&from.pair_with(to))
            .and_then(|s| nearest_prior(s, date));
        let rate = match direct {
            Some(rate) => Some(rate),
            None => state
                .rates
                .get(&to.pair_with(from))
                .and_then(|s| nearest_prior(s, date))
                .and_then(|inverse| Decimal::one().checked_div(inverse)),
        };
        rate.map(|r| r.round_dp(RATE_PRECISION))
            .filter(|r| !r.is_zero())
    }
}

#[async_trait]
impl PriceRateCache for InMemoryPriceRateCache {
    async fn ensure_prices(&self, symbols: &[Symbol], from: NaiveDate) -> Vec<Symbol> {
        let pending = self.symbols_to_fetch(symbols, from);
        let batch_size = self.settings.batch_size.max(1);

        for (i, chunk) in pending.chunks(batch_size).enumerate() {
            if i > 0 {
                tokio::time::sleep(self.settings.batch_delay).await;
            }
            let fetches = chunk.iter().map(|symbol| async move {
                let result = self
                    .provider
                    .fetch_price_history(symbol.as_str(), Some(from))
                    .await;
                (symbol, result)
            });
            for (symbol, result) in join_all(fetches).await {
                match result {
                    Ok(points) => {
                        debug!(symbol = %symbol, rows = points.len(), "Fetched price history");
                        self.store_prices(symbol, from, points);
                    }
                    // Counts as no data; coverage is not recorded so the next request retries.
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "Price fetch failed");
                        self.write().symbols_without_data.insert(symbol.clone());
                    }
                }
            }
        }

        let state = self.read();
        let mut seen = HashSet::new();
        symbols
            .iter()
            .filter(|s| seen.insert((*s).clone()))
            .filter(|s| {
                state.symbols_without_data.contains(*s) || !state.prices.contains_key(*s)
            })
            .cloned()
            .collect()
    }

    async fn ensure_rate(&self, a: &Currency, b: &Currency, from: NaiveDate) -> Option<String> {
        if a == b {
            return None;
        }
        let ab = a.pair_with(b);
        let ba = b.pair_with(a);
        if self.covered_pair(&ab, &ba, from).is_some() {
            return None;
        }
        let known_unresolved = self.read().unresolved_pairs.contains(&ab);
        if known_unresolved {
            return Some(ab);
        }

        for pair in self.pair_candidates(&ab, &ba) {
            let points = self.fetch_pair(&pair, from).await;
            if !points.is_empty() {
                debug!(pair = %pair, rows = points.len(), "Fetched rate history");
                self.store_rates(&pair, from, points);
                return None;
            }
        }

        warn!(pair = %ab, "No rate history in either direction");
        self.write().unresolved_pairs.insert(ab.clone());
        Some(ab)
    }

    fn fill_from_trades(
        &self,
        trades: &[Trade],
        symbols: &[Symbol],
        pairs: &[(Currency, Currency)],
        end: NaiveDate,
    ) {
        for symbol in symbols {
            let matching: Vec<&Trade> = trades
                .iter()
                .filter(|t| t.kind == TradeKind::Trade && &t.symbol == symbol)
                .collect();
            let series = daily_series(&observations(&matching, |t| t.price), end);
            if series.is_empty() {
                continue;
            }
            info!(symbol = %symbol, days = series.len(), "Interpolating prices from trades");
            let mut state = self.write();
            let cached = state.prices.entry(symbol.clone()).or_default();
            for (date, price) in series {
                cached.entry(date).or_insert(price);
            }
        }

        for (from, to) in pairs {
            let matching: Vec<&Trade> = trades.iter().filter(|t| &t.currency == from).collect();
            let series = daily_series(&observations(&matching, |t| t.rate), end);
            if series.is_empty() {
                continue;
            }
            let pair = from.pair_with(to);
            info!(pair = %pair, days = series.len(), "Interpolating rates from trades");
            let mut state = self.write();
            let cached = state.rates.entry(pair).or_default();
            for (date, rate) in series {
                cached.entry(date).or_insert(rate);
            }
        }

        for trade in trades.iter().filter(|t| t.kind == TradeKind::Trade) {
            let date = trade.trade_date();
            if self.lookup_price(date, &trade.symbol).is_none() && trade.price.is_positive() {
                debug!(symbol = %trade.symbol, date = %date, "Seeding trade price");
                self.insert_price(&trade.symbol, date, trade.price);
            }
        }
    }

    fn clear(&self) {
        *self.write() = CacheState::default();
        info!("Price cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::MockMarketData;
    use crate::domain::parse_day;
    use crate::domain::trade::fixtures::{d, trade};
    use crate::domain::Side;

    fn day(s: &str) -> NaiveDate {
        parse_day(s).unwrap()
    }

    fn cache_with(mock: MockMarketData) -> InMemoryPriceRateCache {
        InMemoryPriceRateCache::new(
            Arc::new(mock),
            FetchSettings {
                batch_size: 10,
                batch_delay: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_lookup_price_within_window() {
        let cache = cache_with(MockMarketData::new().with_price("XYZ", day("2024-01-07"), d("42")));
        let missing = cache
            .ensure_prices(&[Symbol::new("XYZ")], day("2024-01-01"))
            .await;
        assert!(missing.is_empty());

        let xyz = Symbol::new("XYZ");
        assert_eq!(cache.lookup_price(day("2024-01-07"), &xyz), Some(d("42")));
        assert_eq!(cache.lookup_price(day("2024-01-10"), &xyz), Some(d("42")));
        assert_eq!(cache.lookup_price(day("2024-01-17"), &xyz), Some(d("42")));
        assert_eq!(cache.lookup_price(day("2024-01-18"), &xyz), None);
        assert_eq!(cache.lookup_price(day("2024-01-06"), &xyz), None);
    }

    #[tokio::test]
    async fn test_ensure_prices_skips_covered_symbols() {
        let mock = MockMarketData::new().with_price("XYZ", day("2024-01-02"), d("1"));
        let calls = mock.clone();
        let cache = cache_with(mock);
        let xyz = [Symbol::new("XYZ")];

        cache.ensure_prices(&xyz, day("2024-01-01")).await;
        cache.ensure_prices(&xyz, day("2024-01-05")).await;
        assert_eq!(calls.call_count(), 1);

        cache.ensure_prices(&xyz, day("2023-12-01")).await;
        assert_eq!(calls.call_count(), 2);
    }

    #[tokio::test]
    async fn test_ensure_prices_reports_symbols_without_data() {
        let mock = MockMarketData::new()
            .with_price("OK", day("2024-01-02"), d("1"))
            .with_failure("DOWN");
        let cache = cache_with(mock);
        let symbols = [Symbol::new("OK"), Symbol::new("DOWN"), Symbol::new("NONE")];

        let missing = cache.ensure_prices(&symbols, day("2024-01-01")).await;
        assert_eq!(missing, vec![Symbol::new("DOWN"), Symbol::new("NONE")]);

        // Stable on a second call even though NONE is not refetched.
        let again = cache.ensure_prices(&symbols, day("2024-01-01")).await;
        assert_eq!(again, missing);
    }

    #[tokio::test]
    async fn test_failed_symbol_stays_missing_after_interpolation() {
        let mock = MockMarketData::new().with_failure("XYZ");
        let cache = cache_with(mock.clone());
        let xyz = [Symbol::new("XYZ")];
        let buy = trade(TradeKind::Trade, Side::Buy, "XYZ", "2024-01-10");

        let missing = cache.ensure_prices(&xyz, day("2023-12-31")).await;
        assert_eq!(missing, xyz.to_vec());
        cache.fill_from_trades(&[buy], &missing, &[], day("2024-01-12"));
        assert!(cache.lookup_price(day("2024-01-12"), &xyz[0]).is_some());

        // Retried, and still reported so callers extend the interpolation.
        let again = cache.ensure_prices(&xyz, day("2023-12-31")).await;
        assert_eq!(again, xyz.to_vec());
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_ensure_prices_throttles_in_batches() {
        let mut mock = MockMarketData::new();
        let mut symbols = Vec::new();
        for i in 0..25 {
            let name = format!("S{}", i);
            mock = mock.with_price(&name, day("2024-01-02"), d("1"));
            symbols.push(Symbol::new(name));
        }
        let calls = mock.clone();
        let cache = InMemoryPriceRateCache::new(
            Arc::new(mock),
            FetchSettings {
                batch_size: 10,
                batch_delay: Duration::from_millis(20),
            },
        );

        let started = std::time::Instant::now();
        let missing = cache.ensure_prices(&symbols, day("2024-01-01")).await;
        assert!(missing.is_empty());
        assert_eq!(calls.call_count(), 25);
        // Three batches means two pauses.
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_lookup_rate_same_direct_and_inverse() {
        let mock = MockMarketData::new().with_fx("EURUSD", day("2024-01-02"), d("1.25"));
        let cache = cache_with(mock);
        let (eur, usd) = (Currency::new("EUR"), Currency::new("USD"));

        assert_eq!(cache.ensure_rate(&usd, &eur, day("2024-01-01")).await, None);
        assert_eq!(cache.lookup_rate(&eur, &usd, day("2024-01-03")), Some(d("1.25")));
        assert_eq!(cache.lookup_rate(&usd, &eur, day("2024-01-03")), Some(d("0.8")));
        assert_eq!(cache.lookup_rate(&usd, &usd, day("2024-01-03")), Some(d("1")));
        assert_eq!(cache.lookup_rate(&usd, &eur, day("2023-12-31")), None);

        assert_eq!(
            cache.price_to_base_currency(d("10"), day("2024-01-03"), &eur, &usd),
            Some(d("12.5"))
        );
        assert_eq!(
            cache.price_to_base_currency(d("10"), day("2023-12-31"), &eur, &usd),
            None
        );
    }

    #[tokio::test]
    async fn test_lookup_rate_rounds_to_four_places() {
        let mock = MockMarketData::new().with_fx("USDSEK", day("2024-01-02"), d("3"));
        let cache = cache_with(mock);
        let (usd, sek) = (Currency::new("USD"), Currency::new("SEK"));
        cache.ensure_rate(&usd, &sek, day("2024-01-01")).await;
        assert_eq!(cache.lookup_rate(&sek, &usd, day("2024-01-02")), Some(d("0.3333")));
    }

    #[tokio::test]
    async fn test_ensure_rate_falls_back_to_full_history() {
        let mock = MockMarketData::new()
            .with_fx("GBPUSD", day("2015-01-01"), d("1.5"))
            .with_full_history_only("GBPUSD");
        let cache = cache_with(mock);
        let (gbp, usd) = (Currency::new("GBP"), Currency::new("USD"));

        assert_eq!(cache.ensure_rate(&gbp, &usd, day("2015-01-01")).await, None);
        assert_eq!(cache.lookup_rate(&gbp, &usd, day("2015-01-05")), Some(d("1.5")));
    }

    #[tokio::test]
    async fn test_ensure_rate_unresolved_pair() {
        let cache = cache_with(MockMarketData::new().with_failure("AAABBB"));
        let (a, b) = (Currency::new("AAA"), Currency::new("BBB"));
        assert_eq!(
            cache.ensure_rate(&a, &b, day("2024-01-01")).await,
            Some("AAABBB".to_string())
        );
        assert_eq!(cache.lookup_rate(&a, &b, day("2024-01-01")), None);
    }

    #[test]
    fn test_fill_from_trades_interpolates_and_keeps_provider_data() {
        let cache = cache_with(MockMarketData::new());
        let xyz = Symbol::new("XYZ");
        cache.insert_price(&xyz, day("2024-01-03"), d("500"));

        let mut buy = trade(TradeKind::Trade, Side::Buy, "XYZ", "2024-01-01");
        buy.price = d("100");
        let mut sell = trade(TradeKind::Trade, Side::Sell, "XYZ", "2024-01-05");
        sell.price = d("120");

        cache.fill_from_trades(&[buy, sell], &[xyz.clone()], &[], day("2024-01-06"));
        assert_eq!(cache.lookup_price(day("2024-01-02"), &xyz), Some(d("105")));
        assert_eq!(cache.lookup_price(day("2024-01-03"), &xyz), Some(d("500")));
        assert_eq!(cache.lookup_price(day("2024-01-06"), &xyz), Some(d("120")));
    }

    #[test]
    fn test_fill_from_trades_rates_and_seeding() {
        let cache = cache_with(MockMarketData::new());
        let mut buy = trade(TradeKind::Trade, Side::Buy, "ABC", "2024-01-10");
        buy.currency = Currency::new("EUR");
        buy.rate = d("1.1");
        buy.price = d("7");
        let (eur, usd) = (Currency::new("EUR"), Currency::new("USD"));

        cache.fill_from_trades(&[buy], &[], &[(eur.clone(), usd.clone())], day("2024-01-12"));
        assert_eq!(cache.lookup_rate(&eur, &usd, day("2024-01-12")), Some(d("1.1")));
        // Unresolvable on the trade date, so the trade price is seeded.
        assert_eq!(cache.lookup_price(day("2024-01-10"), &Symbol::new("ABC")), Some(d("7")));
    }

    #[tokio::test]
    async fn test_clear_forgets_everything() {
        let mock = MockMarketData::new().with_price("XYZ", day("2024-01-02"), d("1"));
        let calls = mock.clone();
        let cache = cache_with(mock);
        let xyz = [Symbol::new("XYZ")];
        cache.ensure_prices(&xyz, day("2024-01-01")).await;
        cache.clear();
        assert_eq!(cache.lookup_price(day("2024-01-02"), &xyz[0]), None);
        cache.ensure_prices(&xyz, day("2024-01-01")).await;
        assert_eq!(calls.call_count(), 2);
    }
}
