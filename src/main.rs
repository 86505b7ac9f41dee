use navhistory::orchestration::{Maintenance, MaintenanceSettings};
use navhistory::pricing::FetchSettings;
use navhistory::{
    api, config::Config, db::init_db, HttpMarketData, InMemoryPriceRateCache, MarketDataProvider,
    PriceRateCache, Repository, ValuationCache,
};
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let port = config.port;

    // Initialize database and dependencies
    let pool = match init_db(&config.database_path).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let repo = Arc::new(Repository::new(pool));
    let provider: Arc<dyn MarketDataProvider> = match HttpMarketData::new(
        config.market_data_url.clone(),
        config.provider_timeout,
    ) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            eprintln!("Failed to build market data client: {}", e);
            std::process::exit(1);
        }
    };
    let prices: Arc<dyn PriceRateCache> = Arc::new(InMemoryPriceRateCache::new(
        provider,
        FetchSettings {
            batch_size: config.price_fetch_batch,
            batch_delay: config.price_fetch_delay,
        },
    ));
    let cache = Arc::new(ValuationCache::new(repo.clone(), prices));

    if let Some(period) = config.maintenance_interval {
        let maintenance = Maintenance::new(
            repo.clone(),
            cache.clone(),
            MaintenanceSettings {
                stale_after_minutes: config.history_max_age_minutes,
                retention_years: config.retention_years,
                ..MaintenanceSettings::default()
            },
        );
        tracing::info!(period_secs = period.as_secs(), "Maintenance enabled");
        tokio::spawn(maintenance.run_periodically(period));
    }

    // Create router
    let app = api::create_router(api::AppState::new(repo, cache, config));

    // Bind to address
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Server listening on {}", addr);

    // Run server
    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}
