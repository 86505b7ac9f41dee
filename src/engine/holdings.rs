use crate::domain::{CashFlow, Currency, Decimal, Direction, LedgerEntry, Symbol, Trade};
use std::collections::BTreeMap;

use super::DayFault;

/// Aggregated position in one symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holding {
    /// Net volume. Negative only after over-selling.
    pub volume: Decimal,
    /// Trade currency of the first entry for this symbol.
    pub currency: Currency,
    /// Invested value in the portfolio currency, fees included.
    pub cost_basis: Decimal,
}

impl Holding {
    pub fn new(currency: Currency) -> Self {
        Self {
            volume: Decimal::zero(),
            currency,
            cost_basis: Decimal::zero(),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.volume.is_zero()
    }
}

/// Holdings, cash and fund shares of a portfolio during one replay pass.
///
/// Amounts are in the portfolio currency; every entry is converted with the
/// trade's own recorded rate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HoldingsBook {
    holdings: BTreeMap<Symbol, Holding>,
    pub cash: Decimal,
    pub shares: Decimal,
}

impl HoldingsBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &Symbol) -> Option<&Holding> {
        self.holdings.get(symbol)
    }

    /// Holdings in symbol order.
    pub fn holdings(&self) -> impl Iterator<Item = (&Symbol, &Holding)> {
        self.holdings.iter()
    }

    /// Apply one ledger entry.
    ///
    /// # Errors
    /// `DayFault::InvalidEntry` for entries that cannot be replayed and
    /// `DayFault::Overflow` if an amount leaves the decimal range. The book
    /// may be partially updated on error; callers apply to a copy.
    pub fn apply(&mut self, trade: &Trade) -> Result<(), DayFault> {
        let overflow = || DayFault::Overflow(trade.id.clone());
        let mul = |a: Decimal, b: Decimal| a.checked_mul(b).ok_or_else(overflow);
        let add = |a: Decimal, b: Decimal| a.checked_add(b).ok_or_else(overflow);
        let sub = |a: Decimal, b: Decimal| a.checked_sub(b).ok_or_else(overflow);

        match trade.entry()? {
            LedgerEntry::Trade {
                symbol,
                currency,
                direction,
                price,
                volume,
                fee,
                rate,
            } => {
                let notional = mul(mul(price, rate)?, volume)?;
                let fee = mul(fee, rate)?;
                let holding = self
                    .holdings
                    .entry(symbol)
                    .or_insert_with(|| Holding::new(currency));

                match direction {
                    Direction::Buy => {
                        holding.cost_basis = add(holding.cost_basis, add(notional, fee)?)?;
                        self.cash = sub(sub(self.cash, notional)?, fee)?;
                    }
                    Direction::Sell => {
                        if holding.volume.is_positive() {
                            let sold = if volume < holding.volume {
                                volume
                            } else {
                                holding.volume
                            };
                            let avg_cost = holding
                                .cost_basis
                                .checked_div(holding.volume)
                                .ok_or_else(overflow)?;
                            holding.cost_basis = sub(holding.cost_basis, mul(avg_cost, sold)?)?;
                        }
                        self.cash = sub(add(self.cash, notional)?, fee)?;
                    }
                }
                holding.volume = add(holding.volume, mul(direction.sign(), volume)?)?;
            }
            LedgerEntry::CashFlow {
                flow,
                amount,
                fee,
                rate,
            } => {
                let amount = mul(amount, rate)?;
                let fee = mul(fee, rate)?;
                self.cash = match flow {
                    CashFlow::Put => sub(add(self.cash, amount)?, fee)?,
                    CashFlow::Withdraw => sub(sub(self.cash, amount)?, fee)?,
                };
            }
            LedgerEntry::Dividend { amount, fee, rate }
            | LedgerEntry::Correction { amount, fee, rate } => {
                self.cash = sub(add(self.cash, mul(amount, rate)?)?, mul(fee, rate)?)?;
            }
            LedgerEntry::Investment {
                amount,
                fee,
                rate,
                shares,
            } => {
                self.cash = sub(add(self.cash, mul(amount, rate)?)?, mul(fee, rate)?)?;
                if let Some(shares) = shares {
                    self.shares = add(self.shares, shares)?;
                }
            }
        }
        Ok(())
    }

    /// Remove holdings whose volume nets to exactly zero.
    pub fn drop_flat(&mut self) {
        self.holdings.retain(|_, h| !h.is_flat());
    }
}
