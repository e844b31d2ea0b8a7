use thiserror::Error;

use crate::domain::services::orderbook::OrderbookError;

pub mod matching_engine;

/// Re-export key types for convenience
pub use self::matching_engine::{EngineState, MatchingEngine, PassSummary};

/// Errors that can occur during matching engine operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatchingError {
    /// Orderbook error occurred
    #[error("Orderbook error: {0}")]
    Orderbook(#[from] OrderbookError),

    /// The trade outbox receiver was dropped, so trades can no longer be emitted.
    #[error("Trade sink closed")]
    TradeSinkClosed,
}

impl MatchingError {
    /// Whether the failed pass can simply be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Orderbook(err) => err.is_retryable(),
            Self::TradeSinkClosed => false,
        }
    }
}
