//! Day-by-day replay of a trade ledger into valuation snapshots.

use crate::domain::{
    days_inclusive, Currency, Decimal, PortfolioId, Side, Symbol, TimeMs, Trade, TradeKind,
    ValuationSnapshot,
};
use crate::pricing::PriceLookup;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::{debug, warn};

use super::{DayFault, HoldingsBook};

/// Everything one replay pass needs. `trades` must be active, sorted by
/// trade time and limited to `till`.
#[derive(Debug, Clone)]
pub struct ReplayInput<'a> {
    pub portfolio_id: &'a PortfolioId,
    pub currency: &'a Currency,
    pub base_instrument: Option<&'a Symbol>,
    pub trades: &'a [Trade],
    pub from: NaiveDate,
    pub till: NaiveDate,
    pub now: TimeMs,
}

/// A day whose trades could not be applied; its totals repeat the previous day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradedDay {
    pub date: NaiveDate,
    pub fault: DayFault,
}

/// A holding left out of a day's invested value for lack of price or rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnvaluedHolding {
    pub date: NaiveDate,
    pub symbol: Symbol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Buy,
    Sell,
    Deposit,
    Withdrawal,
    Dividend,
    Investment,
    Correction,
}

/// One in-range trade as applied, with the book state right after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeDetail {
    pub operation: Operation,
    pub trade_time: NaiveDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<Symbol>,
    pub currency: Currency,
    pub rate: Decimal,
    /// Price for trades, amount for every other kind.
    pub price: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    pub fee: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<Decimal>,
    /// Running cash after the trade, in the portfolio currency.
    pub cash: Decimal,
    /// Net volume of `symbol` after the trade.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_volume: Option<Decimal>,
}

impl TradeDetail {
    fn after(trade: &Trade, book: &HoldingsBook) -> Self {
        let operation = match (trade.kind, trade.side) {
            (TradeKind::Trade, Side::Sell) => Operation::Sell,
            (TradeKind::Trade, _) => Operation::Buy,
            (TradeKind::CashFlow, Side::Withdraw) => Operation::Withdrawal,
            (TradeKind::CashFlow, _) => Operation::Deposit,
            (TradeKind::Dividend, _) => Operation::Dividend,
            (TradeKind::Investment, _) => Operation::Investment,
            (TradeKind::Correction, _) => Operation::Correction,
        };
        let is_trade = trade.kind == TradeKind::Trade;
        let has_symbol = matches!(trade.kind, TradeKind::Trade | TradeKind::Dividend);
        Self {
            operation,
            trade_time: trade.trade_time,
            symbol: has_symbol.then(|| trade.symbol.clone()),
            currency: trade.currency.clone(),
            rate: trade.rate,
            price: trade.price,
            volume: is_trade.then_some(trade.volume),
            fee: trade.fee,
            shares: if trade.kind == TradeKind::Investment {
                trade.shares
            } else {
                None
            },
            cash: book.cash,
            new_volume: is_trade.then(|| {
                book.get(&trade.symbol)
                    .map(|h| h.volume)
                    .unwrap_or_default()
            }),
        }
    }

    pub fn rounded(&self, precision: u32) -> Self {
        Self {
            cash: self.cash.round_dp(precision),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayOutput {
    pub snapshots: Vec<ValuationSnapshot>,
    pub degraded_days: Vec<DegradedDay>,
    pub unvalued: Vec<UnvaluedHolding>,
    /// Trades applied within the range, in ledger order. Trades of degraded
    /// days are not listed.
    pub details: Vec<TradeDetail>,
}

#[derive(Debug, Clone, Copy, Default)]
struct DayTotals {
    invested: Decimal,
    cash: Decimal,
    nav: Decimal,
    shares: Decimal,
}

/// Replay `input.trades` and emit one snapshot per calendar day in
/// `[from, till]`.
///
/// Trades before `from` only build the opening book. Each day's trades are
/// applied to a copy of the book; if any of them faults the copy is
/// discarded and the day repeats the previous day's totals.
pub fn replay_days<P: PriceLookup + ?Sized>(input: &ReplayInput<'_>, prices: &P) -> ReplayOutput {
    let mut output = ReplayOutput::default();
    let mut book = HoldingsBook::new();
    let mut remaining = input.trades;

    // Opening book, grouped per day exactly like the in-range loop.
    while let Some(first) = remaining.first() {
        let date = first.trade_date();
        if date >= input.from {
            break;
        }
        let (todays, rest) = split_day(remaining, date);
        remaining = rest;
        match apply_day(&book, todays) {
            Ok((next, _)) => book = next,
            Err(fault) => warn!(
                portfolio_id = %input.portfolio_id,
                date = %date,
                fault = %fault,
                "Skipping faulty day before range start"
            ),
        }
    }

    let mut previous: Option<DayTotals> = None;
    let mut first_nav_share: Option<Decimal> = None;
    let mut previous_nav_share: Option<Decimal> = None;
    let mut benchmark = Decimal::zero();

    for day in days_inclusive(input.from, input.till) {
        let todays = match remaining.first() {
            Some(t) if t.trade_date() == day => {
                let (todays, rest) = split_day(remaining, day);
                remaining = rest;
                todays
            }
            _ => &[],
        };

        let computed = apply_day(&book, todays).and_then(|(next, details)| {
            let totals = value_day(input, &next, day, prices, &mut output.unvalued)?;
            Ok((next, details, totals))
        });
        let totals = match computed {
            Ok((next, details, totals)) => {
                book = next;
                output.details.extend(details);
                totals
            }
            Err(fault) => {
                warn!(
                    portfolio_id = %input.portfolio_id,
                    date = %day,
                    fault = %fault,
                    "Day degraded, carrying forward previous totals"
                );
                output.degraded_days.push(DegradedDay { date: day, fault });
                previous.unwrap_or(DayTotals {
                    cash: book.cash,
                    nav: book.cash,
                    shares: book.shares,
                    ..DayTotals::default()
                })
            }
        };
        previous = Some(totals);

        if let Some(symbol) = input.base_instrument {
            if let Some(price) = prices.lookup_price(day, symbol) {
                benchmark = price;
            }
        }

        let share_count = if totals.shares.is_positive() {
            totals.shares
        } else {
            Decimal::one()
        };
        let nav_per_share = totals.nav.checked_div(share_count).unwrap_or_default();
        let first = *first_nav_share.get_or_insert(nav_per_share);
        let first_divisor = if first.is_zero() { Decimal::one() } else { first };
        let perf_per_share = (Decimal::hundred() * nav_per_share)
            .checked_div(first_divisor)
            .unwrap_or_default();
        let performance = match previous_nav_share {
            Some(prev) if !prev.is_zero() => nav_per_share
                .checked_div(prev)
                .map(|ratio| Decimal::hundred() * (ratio - Decimal::one()))
                .unwrap_or_default(),
            _ => Decimal::zero(),
        };
        previous_nav_share = Some(nav_per_share);

        output.snapshots.push(ValuationSnapshot {
            portfolio_id: input.portfolio_id.clone(),
            date: day,
            invested_value: totals.invested,
            cash: totals.cash,
            nav: totals.nav,
            benchmark_index_value: benchmark,
            performance,
            share_count,
            nav_per_share,
            perf_per_share,
            last_updated: input.now,
            is_calculated: true,
        });
    }

    output
}

/// Leading trades dated `date`, and the rest.
fn split_day(trades: &[Trade], date: NaiveDate) -> (&[Trade], &[Trade]) {
    let end = trades
        .iter()
        .position(|t| t.trade_date() != date)
        .unwrap_or(trades.len());
    trades.split_at(end)
}

fn apply_day(
    book: &HoldingsBook,
    trades: &[Trade],
) -> Result<(HoldingsBook, Vec<TradeDetail>), DayFault> {
    let mut next = book.clone();
    let mut details = Vec::with_capacity(trades.len());
    for trade in trades {
        next.apply(trade)?;
        details.push(TradeDetail::after(trade, &next));
    }
    next.drop_flat();
    Ok((next, details))
}

fn value_day<P: PriceLookup + ?Sized>(
    input: &ReplayInput<'_>,
    book: &HoldingsBook,
    day: NaiveDate,
    prices: &P,
    unvalued: &mut Vec<UnvaluedHolding>,
) -> Result<DayTotals, DayFault> {
    let mut invested = Decimal::zero();
    for (symbol, holding) in book.holdings() {
        let quote = |date: NaiveDate| {
            let price = prices.lookup_price(date, symbol)?;
            let rate = prices.lookup_rate(&holding.currency, input.currency, date)?;
            Some((price, rate))
        };
        let Some((price, rate)) = quote(day).or_else(|| day.pred_opt().and_then(quote)) else {
            debug!(
                portfolio_id = %input.portfolio_id,
                symbol = %symbol,
                date = %day,
                "No price or rate, holding excluded from valuation"
            );
            unvalued.push(UnvaluedHolding {
                date: day,
                symbol: symbol.clone(),
            });
            continue;
        };
        let value = price
            .checked_mul(rate)
            .and_then(|v| v.checked_mul(holding.volume))
            .and_then(|v| v.checked_add(invested))
            .ok_or_else(|| DayFault::Overflow(format!("valuation of {}", symbol)))?;
        invested = value;
    }

    let nav = invested
        .checked_add(book.cash)
        .ok_or_else(|| DayFault::Overflow("nav".to_string()))?;
    Ok(DayTotals {
        invested,
        cash: book.cash,
        nav,
        shares: book.shares,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::parse_day;
    use crate::domain::trade::fixtures::{d, trade};
    use crate::domain::{Side, TradeKind};
    use std::collections::HashMap;

    #[derive(Default)]
    struct FixedPrices {
        prices: HashMap<(NaiveDate, Symbol), Decimal>,
    }

    impl FixedPrices {
        fn with(mut self, day: &str, symbol: &str, price: &str) -> Self {
            self.prices
                .insert((parse_day(day).unwrap(), Symbol::new(symbol)), d(price));
            self
        }
    }

    impl PriceLookup for FixedPrices {
        fn lookup_price(&self, date: NaiveDate, symbol: &Symbol) -> Option<Decimal> {
            self.prices.get(&(date, symbol.clone())).copied()
        }

        fn lookup_rate(&self, from: &Currency, to: &Currency, _date: NaiveDate) -> Option<Decimal> {
            (from == to).then(Decimal::one)
        }
    }

    fn day(s: &str) -> NaiveDate {
        parse_day(s).unwrap()
    }

    fn run(trades: &[Trade], from: &str, till: &str, prices: &FixedPrices) -> ReplayOutput {
        let pid = PortfolioId::new("p1");
        let usd = Currency::new("USD");
        let benchmark = Symbol::new("IDX");
        let input = ReplayInput {
            portfolio_id: &pid,
            currency: &usd,
            base_instrument: Some(&benchmark),
            trades,
            from: day(from),
            till: day(till),
            now: TimeMs::new(0),
        };
        replay_days(&input, prices)
    }

    fn xyz_buy() -> Trade {
        let mut buy = trade(TradeKind::Trade, Side::Buy, "XYZ", "2024-01-10");
        buy.fee = d("1");
        buy
    }

    #[test]
    fn test_single_buy_two_days() {
        let prices = FixedPrices::default()
            .with("2024-01-10", "XYZ", "100")
            .with("2024-01-11", "XYZ", "105");
        let out = run(&[xyz_buy()], "2024-01-10", "2024-01-11", &prices);

        assert_eq!(out.snapshots.len(), 2);
        let (d1, d2) = (&out.snapshots[0], &out.snapshots[1]);
        assert_eq!(d1.invested_value, d("1000"));
        assert_eq!(d1.cash, d("-1001"));
        assert_eq!(d1.nav, d("-1"));
        assert_eq!(d2.invested_value, d("1050"));
        assert_eq!(d2.cash, d1.cash);
        assert_eq!(d2.nav, d("49"));
        assert!(out.degraded_days.is_empty());
    }

    #[test]
    fn test_every_calendar_day_is_emitted() {
        let prices = FixedPrices::default().with("2024-01-10", "XYZ", "100");
        let out = run(&[xyz_buy()], "2024-01-10", "2024-01-16", &prices);
        let dates: Vec<NaiveDate> = out.snapshots.iter().map(|s| s.date).collect();
        assert_eq!(dates.len(), 7);
        assert_eq!(dates[6], day("2024-01-16"));
    }

    #[test]
    fn test_previous_day_fallback_then_exclusion() {
        // Lookups here are exact-date only, so day 2 uses day 1 and day 3 has nothing.
        let prices = FixedPrices::default().with("2024-01-10", "XYZ", "100");
        let out = run(&[xyz_buy()], "2024-01-10", "2024-01-12", &prices);
        assert_eq!(out.snapshots[1].invested_value, d("1000"));
        assert_eq!(out.snapshots[2].invested_value, Decimal::zero());
        assert_eq!(out.snapshots[2].nav, d("-1001"));
        assert_eq!(
            out.unvalued,
            vec![UnvaluedHolding {
                date: day("2024-01-12"),
                symbol: Symbol::new("XYZ")
            }]
        );
    }

    #[test]
    fn test_pre_range_trades_open_the_book() {
        let prices = FixedPrices::default()
            .with("2024-01-10", "XYZ", "100")
            .with("2024-01-12", "XYZ", "110");
        let full = run(&[xyz_buy()], "2024-01-10", "2024-01-12", &prices);
        let tail = run(&[xyz_buy()], "2024-01-12", "2024-01-12", &prices);
        assert_eq!(tail.snapshots.len(), 1);
        assert_eq!(tail.snapshots[0].invested_value, full.snapshots[2].invested_value);
        assert_eq!(tail.snapshots[0].cash, full.snapshots[2].cash);
    }

    #[test]
    fn test_faulty_day_repeats_previous_totals() {
        let prices = FixedPrices::default()
            .with("2024-01-10", "XYZ", "100")
            .with("2024-01-11", "XYZ", "100");
        let mut bad = trade(TradeKind::Trade, Side::Put, "XYZ", "2024-01-11");
        bad.id = "bad".to_string();
        let mut ok_same_day = trade(TradeKind::CashFlow, Side::Put, "", "2024-01-11");
        ok_same_day.price = d("500");

        let out = run(&[xyz_buy(), ok_same_day, bad], "2024-01-10", "2024-01-11", &prices);
        assert_eq!(out.degraded_days.len(), 1);
        assert_eq!(out.degraded_days[0].date, day("2024-01-11"));
        assert_eq!(out.snapshots[1].cash, out.snapshots[0].cash);
        assert_eq!(out.snapshots[1].nav, out.snapshots[0].nav);
    }

    #[test]
    fn test_shares_and_per_share_figures() {
        let prices = FixedPrices::default();
        let mut seed = trade(TradeKind::Investment, Side::Put, "", "2024-01-01");
        seed.price = d("1000");
        seed.shares = Some(d("10"));
        let mut growth = trade(TradeKind::Dividend, Side::Put, "", "2024-01-02");
        growth.price = d("100");

        let out = run(&[seed, growth], "2024-01-01", "2024-01-02", &prices);
        let (d1, d2) = (&out.snapshots[0], &out.snapshots[1]);
        assert_eq!(d1.share_count, d("10"));
        assert_eq!(d1.nav_per_share, d("100"));
        assert_eq!(d1.perf_per_share, d("100"));
        assert_eq!(d1.performance, Decimal::zero());
        assert_eq!(d2.nav_per_share, d("110"));
        assert_eq!(d2.perf_per_share, d("110"));
        assert_eq!(d2.performance, d("10"));
    }

    #[test]
    fn test_share_count_defaults_to_one() {
        let out = run(&[xyz_buy()], "2024-01-10", "2024-01-10", &FixedPrices::default());
        assert_eq!(out.snapshots[0].share_count, Decimal::one());
    }

    #[test]
    fn test_benchmark_carries_last_known_value() {
        let prices = FixedPrices::default()
            .with("2024-01-11", "IDX", "4000")
            .with("2024-01-10", "XYZ", "100");
        let out = run(&[xyz_buy()], "2024-01-10", "2024-01-13", &prices);
        let index: Vec<Decimal> = out.snapshots.iter().map(|s| s.benchmark_index_value).collect();
        assert_eq!(index, vec![Decimal::zero(), d("4000"), d("4000"), d("4000")]);
    }

    #[test]
    fn test_details_follow_running_cash_and_volume() {
        let prices = FixedPrices::default().with("2024-01-11", "XYZ", "100");
        let mut deposit = trade(TradeKind::CashFlow, Side::Put, "", "2024-01-11");
        deposit.price = d("2000");
        let mut sell = trade(TradeKind::Trade, Side::Sell, "XYZ", "2024-01-11");
        sell.volume = d("4");
        sell.price = d("110");

        // The pre-range buy opens the book but is not listed.
        let out = run(&[xyz_buy(), deposit, sell], "2024-01-11", "2024-01-11", &prices);
        assert_eq!(out.details.len(), 2);

        let (first, second) = (&out.details[0], &out.details[1]);
        assert_eq!(first.operation, Operation::Deposit);
        assert_eq!(first.symbol, None);
        assert_eq!(first.price, d("2000"));
        assert_eq!(first.cash, d("999"));

        assert_eq!(second.operation, Operation::Sell);
        assert_eq!(second.symbol, Some(Symbol::new("XYZ")));
        assert_eq!(second.volume, Some(d("4")));
        assert_eq!(second.price, d("110"));
        assert_eq!(second.cash, d("1439"));
        assert_eq!(second.new_volume, Some(d("6")));

        let json = serde_json::to_value(second).unwrap();
        assert_eq!(json["operation"], "SELL");
        assert_eq!(json["newVolume"], 6.0);
        assert!(serde_json::to_value(first).unwrap().get("newVolume").is_none());
    }

    #[test]
    fn test_degraded_day_lists_no_details() {
        let mut bad = trade(TradeKind::Trade, Side::Buy, "XYZ", "2024-01-11");
        bad.rate = d("0");
        let out = run(&[xyz_buy(), bad], "2024-01-10", "2024-01-11", &FixedPrices::default());
        assert_eq!(out.degraded_days.len(), 1);
        assert_eq!(out.details.len(), 1);
        assert_eq!(out.details[0].new_volume, Some(d("10")));
    }

    #[test]
    fn test_nav_identity_holds() {
        let prices = FixedPrices::default()
            .with("2024-01-10", "XYZ", "100")
            .with("2024-01-11", "XYZ", "90");
        let mut sell = trade(TradeKind::Trade, Side::Sell, "XYZ", "2024-01-11");
        sell.volume = d("4");
        let out = run(&[xyz_buy(), sell], "2024-01-10", "2024-01-11", &prices);
        for snap in &out.snapshots {
            assert_eq!(snap.nav, snap.invested_value + snap.cash);
        }
    }
}
