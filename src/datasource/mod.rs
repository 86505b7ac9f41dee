//! Market-data provider abstraction for historical closing prices and FX rates.

use crate::domain::Decimal;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::fmt;

pub mod http;
pub mod mock;

pub use http::HttpMarketData;
pub use mock::MockMarketData;

/// One daily close as returned by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub close: Decimal,
}

impl PricePoint {
    pub fn new(date: NaiveDate, close: Decimal) -> Self {
        Self { date, close }
    }
}

/// External source of daily price and FX history.
///
/// Implementations handle retry/backoff and timeouts; callers treat any
/// error as "no data for this symbol on this range".
#[async_trait]
pub trait MarketDataProvider: Send + Sync + fmt::Debug {
    /// Fetch daily closes for an instrument.
    ///
    /// # Arguments
    /// * `symbol` - Instrument symbol
    /// * `from` - First day wanted (inclusive); `None` requests the full history
    ///
    /// # Returns
    /// Closes ordered by date ascending
    async fn fetch_price_history(
        &self,
        symbol: &str,
        from: Option<NaiveDate>,
    ) -> Result<Vec<PricePoint>, DataSourceError>;

    /// Fetch daily closes for a currency pair such as `USDEUR`
    /// (units of the second currency per unit of the first).
    async fn fetch_fx_history(
        &self,
        pair: &str,
        from: Option<NaiveDate>,
    ) -> Result<Vec<PricePoint>, DataSourceError>;
}

/// Error type for market-data operations.
#[derive(Debug, Clone)]
pub enum DataSourceError {
    /// Network error (e.g., connection timeout, DNS failure)
    NetworkError(String),
    /// HTTP error (e.g., 404 unknown symbol, 5xx server error)
    HttpError { status: u16, message: String },
    /// Invalid JSON or malformed rows
    ParseError(String),
    /// Rate limit exceeded
    RateLimited,
    Other(String),
}

impl fmt::Display for DataSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSourceError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            DataSourceError::HttpError { status, message } => {
                write!(f, "HTTP error {}: {}", status, message)
            }
            DataSourceError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            DataSourceError::RateLimited => write!(f, "Rate limited"),
            DataSourceError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for DataSourceError {}
