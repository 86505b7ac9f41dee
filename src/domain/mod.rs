//! Domain types for portfolio valuation.
//!
//! This module provides:
//! - Lossless numeric handling via the Decimal wrapper
//! - Primitives: TimeMs, PortfolioId, Symbol, Currency, calendar-day helpers
//! - Trades and the `LedgerEntry` replay view
//! - Portfolio and persisted valuation snapshot types

pub mod decimal;
pub mod portfolio;
pub mod primitives;
pub mod snapshot;
pub mod trade;

pub use decimal::Decimal;
pub use portfolio::Portfolio;
pub use primitives::{
    days_before, days_inclusive, format_day, parse_day, Currency, PortfolioId, Symbol, TimeMs,
    DAY_FORMAT,
};
pub use snapshot::{CalculationStatus, CoverageMetadata, DateRange, ValuationSnapshot};
pub use trade::{
    CashFlow, Direction, InvalidEntry, LedgerEntry, ParseLedgerFieldError, Side, Trade, TradeKind,
    TradeState,
};
