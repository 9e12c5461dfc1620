//! Engine error taxonomy.
//!
//! Validation and funds errors are returned synchronously to the caller and
//! never retried. Scan-loop errors are caught per item and logged instead.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors surfaced by the trading engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or out-of-range input, rejected before any state change.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No price is cached for the requested symbol.
    #[error("no price available for {0}")]
    InstrumentUnavailable(String),

    /// Account balance cannot cover the required charges.
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },

    /// Stop-loss or take-profit on the wrong side of the reference price.
    #[error("invalid stop level: {0}")]
    InvalidStopLevel(String),

    /// Position, link or account missing, not owned by the caller, or in the
    /// wrong state for the requested transition.
    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
