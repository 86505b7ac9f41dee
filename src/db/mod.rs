//! Database module for SQLite operations.
//!
//! This module provides:
//! - Database initialization and migrations
//! - SQLite pragma configuration
//! - Repository layer for portfolios, the trade ledger and the snapshot store

pub mod migrations;
pub mod repo;

pub use migrations::init_db;
pub use repo::{PortfolioDataReport, Repository, RetentionStats, SnapshotRow};
