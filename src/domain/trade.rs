//! Ledger trades and their typed replay view.
//!
//! `Trade` is the stored row. `LedgerEntry` is the tagged union the replay
//! engine matches on exhaustively; converting a trade into an entry is where
//! malformed combinations (e.g. a `Trade` with side `Put`) are rejected.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::{Currency, Decimal, PortfolioId, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeKind {
    Trade,
    Dividend,
    Investment,
    Correction,
    CashFlow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
    Put,
    Withdraw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeState {
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized {field}: {value}")]
pub struct ParseLedgerFieldError {
    pub field: &'static str,
    pub value: String,
}

impl TradeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeKind::Trade => "trade",
            TradeKind::Dividend => "dividend",
            TradeKind::Investment => "investment",
            TradeKind::Correction => "correction",
            TradeKind::CashFlow => "cashflow",
        }
    }
}

impl FromStr for TradeKind {
    type Err = ParseLedgerFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trade" => Ok(TradeKind::Trade),
            "dividend" | "dividends" => Ok(TradeKind::Dividend),
            "investment" => Ok(TradeKind::Investment),
            "correction" => Ok(TradeKind::Correction),
            "cashflow" | "cash" => Ok(TradeKind::CashFlow),
            _ => Err(ParseLedgerFieldError {
                field: "trade kind",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for TradeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
            Side::Put => "put",
            Side::Withdraw => "withdraw",
        }
    }
}

impl FromStr for Side {
    type Err = ParseLedgerFieldError;

    /// Accepts both the long names and the one-letter ledger codes (B/S/P/W).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" | "b" => Ok(Side::Buy),
            "sell" | "s" => Ok(Side::Sell),
            "put" | "p" => Ok(Side::Put),
            "withdraw" | "w" => Ok(Side::Withdraw),
            _ => Err(ParseLedgerFieldError {
                field: "side",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TradeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeState::Active => "active",
            TradeState::Inactive => "inactive",
        }
    }
}

impl FromStr for TradeState {
    type Err = ParseLedgerFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" | "1" => Ok(TradeState::Active),
            "inactive" | "0" | "deleted" => Ok(TradeState::Inactive),
            _ => Err(ParseLedgerFieldError {
                field: "trade state",
                value: s.to_string(),
            }),
        }
    }
}

/// Ledger entry as recorded by the trade-entry API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: String,
    pub portfolio_id: PortfolioId,
    pub kind: TradeKind,
    pub side: Side,
    pub symbol: Symbol,
    pub currency: Currency,
    pub price: Decimal,
    pub volume: Decimal,
    pub fee: Decimal,
    /// Trade-time FX rate from `currency` into the portfolio currency.
    pub rate: Decimal,
    /// Fund shares issued or redeemed (investment entries only).
    pub shares: Option<Decimal>,
    pub trade_time: NaiveDateTime,
    pub state: TradeState,
}

impl Trade {
    pub fn trade_date(&self) -> NaiveDate {
        self.trade_time.date()
    }

    /// Typed replay view of this trade.
    ///
    /// # Errors
    /// Returns `InvalidEntry` for kind/side combinations or values that cannot be replayed.
    pub fn entry(&self) -> Result<LedgerEntry, InvalidEntry> {
        if self.rate.is_negative() || self.rate.is_zero() {
            return Err(self.invalid("rate must be positive"));
        }
        let signed = |amount: Decimal| match self.side {
            Side::Withdraw => -amount,
            _ => amount,
        };

        match self.kind {
            TradeKind::Trade => {
                let direction = match self.side {
                    Side::Buy => Direction::Buy,
                    Side::Sell => Direction::Sell,
                    Side::Put | Side::Withdraw => {
                        return Err(self.invalid("trade side must be buy or sell"))
                    }
                };
                if self.symbol.as_str().is_empty() {
                    return Err(self.invalid("trade without symbol"));
                }
                if self.volume.is_negative() {
                    return Err(self.invalid("negative volume"));
                }
                Ok(LedgerEntry::Trade {
                    symbol: self.symbol.clone(),
                    currency: self.currency.clone(),
                    direction,
                    price: self.price,
                    volume: self.volume,
                    fee: self.fee,
                    rate: self.rate,
                })
            }
            TradeKind::CashFlow => {
                let flow = match self.side {
                    Side::Put => CashFlow::Put,
                    Side::Withdraw => CashFlow::Withdraw,
                    Side::Buy | Side::Sell => {
                        return Err(self.invalid("cash flow side must be put or withdraw"))
                    }
                };
                Ok(LedgerEntry::CashFlow {
                    flow,
                    amount: self.price,
                    fee: self.fee,
                    rate: self.rate,
                })
            }
            TradeKind::Dividend => Ok(LedgerEntry::Dividend {
                amount: signed(self.price),
                fee: self.fee,
                rate: self.rate,
            }),
            TradeKind::Investment => Ok(LedgerEntry::Investment {
                amount: signed(self.price),
                fee: self.fee,
                rate: self.rate,
                shares: self.shares,
            }),
            TradeKind::Correction => Ok(LedgerEntry::Correction {
                amount: signed(self.price),
                fee: self.fee,
                rate: self.rate,
            }),
        }
    }

    fn invalid(&self, reason: &'static str) -> InvalidEntry {
        InvalidEntry {
            trade_id: self.id.clone(),
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("trade {trade_id}: {reason}")]
pub struct InvalidEntry {
    pub trade_id: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// +1 for Buy, -1 for Sell.
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Buy => Decimal::one(),
            Direction::Sell => -Decimal::one(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CashFlow {
    Put,
    Withdraw,
}

/// What a trade does to holdings and cash. Amounts are in the trade currency;
/// `rate` converts them into the portfolio currency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEntry {
    Trade {
        symbol: Symbol,
        currency: Currency,
        direction: Direction,
        price: Decimal,
        volume: Decimal,
        fee: Decimal,
        rate: Decimal,
    },
    CashFlow {
        flow: CashFlow,
        amount: Decimal,
        fee: Decimal,
        rate: Decimal,
    },
    Dividend {
        amount: Decimal,
        fee: Decimal,
        rate: Decimal,
    },
    Investment {
        amount: Decimal,
        fee: Decimal,
        rate: Decimal,
        shares: Option<Decimal>,
    },
    Correction {
        amount: Decimal,
        fee: Decimal,
        rate: Decimal,
    },
}
