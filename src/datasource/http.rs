//! HTTP client for the historical-quotes proxy.
//!
//! `GET {base}/historical?symbol=AAPL&from=2024-01-01` returns an array of
//! `{date, open, high, low, close, "adj close", volume}` rows with string or
//! numeric values. FX pairs are requested as `{pair}:FX`.

use super::{DataSourceError, MarketDataProvider, PricePoint};
use crate::domain::{format_day, parse_day, Decimal};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use chrono::NaiveDate;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HttpMarketData {
    client: Client,
    base_url: String,
}

impl HttpMarketData {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, DataSourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DataSourceError::Other(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_history(
        &self,
        symbol: &str,
        from: Option<NaiveDate>,
    ) -> Result<Vec<PricePoint>, DataSourceError> {
        let url = format!("{}/historical", self.base_url);
        let mut query = vec![("symbol", symbol.to_string())];
        if let Some(from) = from {
            query.push(("from", format_day(from)));
        }
        debug!(symbol, from = ?from, "Fetching history");

        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        let body = retry(backoff, || async {
            let response = self
                .client
                .get(&url)
                .query(&query)
                .send()
                .await
                .map_err(|e| {
                    backoff::Error::transient(DataSourceError::NetworkError(e.to_string()))
                })?;

            let status = response.status();
            if status == 429 {
                return Err(backoff::Error::transient(DataSourceError::RateLimited));
            }
            if status.is_server_error() {
                return Err(backoff::Error::transient(DataSourceError::HttpError {
                    status: status.as_u16(),
                    message: "Server error".to_string(),
                }));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(DataSourceError::HttpError {
                    status: status.as_u16(),
                    message: "Client error".to_string(),
                }));
            }

            response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| backoff::Error::permanent(DataSourceError::ParseError(e.to_string())))
        })
        .await?;

        parse_history(&body)
    }
}

#[async_trait]
impl MarketDataProvider for HttpMarketData {
    async fn fetch_price_history(
        &self,
        symbol: &str,
        from: Option<NaiveDate>,
    ) -> Result<Vec<PricePoint>, DataSourceError> {
        self.get_history(symbol, from).await
    }

    async fn fetch_fx_history(
        &self,
        pair: &str,
        from: Option<NaiveDate>,
    ) -> Result<Vec<PricePoint>, DataSourceError> {
        self.get_history(&format!("{}:FX", pair), from).await
    }
}

/// Parse provider rows. `close` falls back to `adj close`, then to the
/// previous row's close; rows without a usable date or value are skipped.
fn parse_history(body: &serde_json::Value) -> Result<Vec<PricePoint>, DataSourceError> {
    let rows = body
        .as_array()
        .ok_or_else(|| DataSourceError::ParseError("Expected array response".to_string()))?;

    let mut points: Vec<PricePoint> = Vec::with_capacity(rows.len());
    let mut previous_close: Option<Decimal> = None;
    for row in rows {
        let Some(date) = row
            .get("date")
            .and_then(|v| v.as_str())
            .and_then(|s| parse_day(s.get(..10).unwrap_or(s)))
        else {
            warn!(row = %row, "Skipping history row without a valid date");
            continue;
        };

        let close = number_field(row, "close")
            .or_else(|| number_field(row, "adj close"))
            .or(previous_close);
        match close {
            Some(close) => {
                previous_close = Some(close);
                points.push(PricePoint::new(date, close));
            }
            None => debug!(date = %date, "Skipping history row without close"),
        }
    }

    points.sort_by_key(|p| p.date);
    Ok(points)
}

fn number_field(row: &serde_json::Value, key: &str) -> Option<Decimal> {
    let value = row.get(key)?;
    let parsed = match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Decimal::from_str_canonical(s).ok(),
        serde_json::Value::Number(n) => Decimal::from_str_canonical(&n.to_string()).ok(),
        _ => None,
    };
    parsed.filter(|d| d.is_positive())
}
