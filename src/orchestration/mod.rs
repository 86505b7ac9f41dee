pub mod maintenance;
pub mod replay;
pub mod valuation_cache;

pub use maintenance::{Maintenance, MaintenanceSettings, MaintenanceStats};
pub use replay::{LedgerReplayEngine, ReplayError, ReplayResult};
pub use valuation_cache::{
    is_fresh, HistoryRequest, HistoryResponse, UpdateOutcome, ValuationCache, ValuationError,
};
