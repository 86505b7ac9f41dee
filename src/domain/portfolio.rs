use serde::{Deserialize, Serialize};

use super::{Currency, PortfolioId, Symbol};

/// Portfolio as seen by the valuation engine (read-only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Portfolio {
    pub id: PortfolioId,
    pub name: String,
    /// Valuation (base) currency.
    pub currency: Currency,
    /// Benchmark instrument tracked alongside NAV.
    pub base_instrument: Option<Symbol>,
    pub created_by: Option<String>,
}
