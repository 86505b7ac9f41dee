use axum::extract::{Query, State};
use axum::Json;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::db::PortfolioDataReport;
use crate::domain::{parse_day, CoverageMetadata, ValuationSnapshot};
use crate::engine::TradeDetail;
use crate::error::AppError;
use crate::orchestration::HistoryRequest;

const DEFAULT_PRECISION: u32 = 2;
const MAX_PRECISION: u32 = 12;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub portfolio_id: Option<String>,
    pub from: Option<String>,
    pub till: Option<String>,
    pub precision: Option<u32>,
    pub force_refresh: Option<bool>,
    pub max_age_minutes: Option<i64>,
    /// Non-zero adds the applied trades as `details`.
    pub detail: Option<u8>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryBody {
    pub days: Vec<ValuationSnapshot>,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_age_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CoverageMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<TradeDetail>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioQuery {
    pub portfolio_id: Option<String>,
}

pub async fn get_history(
    Query(params): Query<HistoryQuery>,
    State(state): State<AppState>,
) -> Result<Json<HistoryBody>, AppError> {
    let portfolio = required_portfolio(params.portfolio_id.as_deref())?;
    let from = optional_day("from", params.from.as_deref())?;
    let till = optional_day("till", params.till.as_deref())?;

    let precision = params.precision.unwrap_or(DEFAULT_PRECISION);
    if precision > MAX_PRECISION {
        return Err(AppError::BadRequest(format!(
            "precision must be at most {}",
            MAX_PRECISION
        )));
    }
    let max_age_minutes = params
        .max_age_minutes
        .unwrap_or(state.config.history_max_age_minutes);
    if max_age_minutes < 0 {
        return Err(AppError::BadRequest(
            "maxAgeMinutes must not be negative".into(),
        ));
    }

    let request = HistoryRequest {
        portfolio,
        from,
        till,
        precision,
        max_age_minutes,
    };

    let response = if params.force_refresh.unwrap_or(false) {
        state.cache.refresh_uncached(&request).await?
    } else {
        state.cache.get_history(&request).await?
    };

    Ok(Json(HistoryBody {
        days: response.snapshots,
        cached: response.served_from_cache,
        cache_age_minutes: response.cache_age_minutes,
        metadata: response.metadata,
        info: response.info,
        details: (params.detail.unwrap_or(0) != 0).then_some(response.details),
    }))
}

pub async fn get_coverage(
    Query(params): Query<PortfolioQuery>,
    State(state): State<AppState>,
) -> Result<Json<CoverageMetadata>, AppError> {
    let portfolio = resolve_portfolio(&state, params.portfolio_id.as_deref()).await?;
    Ok(Json(state.repo.coverage_metadata(&portfolio.id).await?))
}

pub async fn validate_history(
    Query(params): Query<PortfolioQuery>,
    State(state): State<AppState>,
) -> Result<Json<PortfolioDataReport>, AppError> {
    let portfolio = resolve_portfolio(&state, params.portfolio_id.as_deref()).await?;
    Ok(Json(state.repo.validate_portfolio_data(&portfolio.id).await?))
}

async fn resolve_portfolio(
    state: &AppState,
    id_or_name: Option<&str>,
) -> Result<crate::domain::Portfolio, AppError> {
    let key = required_portfolio(id_or_name)?;
    state
        .repo
        .get_portfolio(&key)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("portfolio {} not found", key)))
}

fn required_portfolio(raw: Option<&str>) -> Result<String, AppError> {
    let trimmed = raw.unwrap_or_default().trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest("portfolioId is required".into()));
    }
    Ok(trimmed.to_string())
}

fn optional_day(field: &str, raw: Option<&str>) -> Result<Option<NaiveDate>, AppError> {
    match raw {
        None | Some("") => Ok(None),
        Some(s) => parse_day(s).map(Some).ok_or_else(|| {
            AppError::BadRequest(format!("{} must be a valid date in YYYY-MM-DD format", field))
        }),
    }
}
