pub mod api;
pub mod config;
pub mod datasource;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod orchestration;
pub mod pricing;

pub use config::Config;
pub use datasource::{DataSourceError, HttpMarketData, MarketDataProvider, MockMarketData};
pub use db::{init_db, Repository};
pub use domain::{
    Currency, Decimal, Portfolio, PortfolioId, Side, Symbol, TimeMs, Trade, TradeKind,
    ValuationSnapshot,
};
pub use error::AppError;
pub use orchestration::{LedgerReplayEngine, ValuationCache};
pub use pricing::{InMemoryPriceRateCache, PriceRateCache};
