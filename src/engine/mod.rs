//! Pure computation engine for deterministic ledger replay.

use crate::domain::InvalidEntry;
use thiserror::Error;

pub mod holdings;
pub mod integrity;
pub mod replay;

pub use holdings::{Holding, HoldingsBook};
pub use integrity::{validate_integrity, IntegrityViolation, SnapshotRecord};
pub use replay::{
    replay_days, DegradedDay, Operation, ReplayInput, ReplayOutput, TradeDetail, UnvaluedHolding,
};

/// Why a day's trades could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DayFault {
    #[error(transparent)]
    InvalidEntry(#[from] InvalidEntry),
    #[error("arithmetic overflow in {0}")]
    Overflow(String),
}
