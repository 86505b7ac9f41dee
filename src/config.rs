use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub market_data_url: String,
    pub provider_timeout: Duration,
    pub price_fetch_batch: usize,
    pub price_fetch_delay: Duration,
    pub history_max_age_minutes: i64,
    pub retention_years: u32,
    /// `None` disables the in-process maintenance loop.
    pub maintenance_interval: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = parse_or(&env_map, "PORT", 8080u16, "must be a valid u16")?;

        let database_path = env_map
            .get("DATABASE_PATH")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("DATABASE_PATH".to_string()))?;

        let market_data_url = env_map
            .get("MARKET_DATA_URL")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("MARKET_DATA_URL".to_string()))?;

        let provider_timeout_secs: u64 = parse_or(
            &env_map,
            "PROVIDER_TIMEOUT_SECS",
            20,
            "must be a number of seconds",
        )?;

        let price_fetch_batch: usize =
            parse_or(&env_map, "PRICE_FETCH_BATCH", 10, "must be a positive integer")?;
        if price_fetch_batch == 0 {
            return Err(ConfigError::InvalidValue(
                "PRICE_FETCH_BATCH".to_string(),
                "must be a positive integer".to_string(),
            ));
        }

        let price_fetch_delay_ms: u64 = parse_or(
            &env_map,
            "PRICE_FETCH_DELAY_MS",
            500,
            "must be a number of milliseconds",
        )?;

        let history_max_age_minutes: i64 = parse_or(
            &env_map,
            "HISTORY_MAX_AGE_MINUTES",
            1440,
            "must be a number of minutes",
        )?;
        if history_max_age_minutes < 0 {
            return Err(ConfigError::InvalidValue(
                "HISTORY_MAX_AGE_MINUTES".to_string(),
                "must not be negative".to_string(),
            ));
        }

        let retention_years: u32 =
            parse_or(&env_map, "RETENTION_YEARS", 5, "must be a number of years")?;

        let maintenance_interval_secs: u64 = parse_or(
            &env_map,
            "MAINTENANCE_INTERVAL_SECS",
            0,
            "must be a number of seconds",
        )?;

        Ok(Config {
            port,
            database_path,
            market_data_url,
            provider_timeout: Duration::from_secs(provider_timeout_secs),
            price_fetch_batch,
            price_fetch_delay: Duration::from_millis(price_fetch_delay_ms),
            history_max_age_minutes,
            retention_years,
            maintenance_interval: (maintenance_interval_secs > 0)
                .then(|| Duration::from_secs(maintenance_interval_secs)),
        })
    }
}

fn parse_or<T: FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: T,
    reason: &str,
) -> Result<T, ConfigError> {
    match env_map.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), reason.to_string())),
    }
}
