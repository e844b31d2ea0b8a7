//--------------------------------------------------------------------------------------------------
// STRUCTS & ENUMS
//--------------------------------------------------------------------------------------------------
// | Name                    | Description                                       | Key Methods       |
// |-------------------------|---------------------------------------------------|-------------------|
// | MatchingEngineEvent     | Event variants for the matching service           | kind              |
// | EventError              | Error types for event processing                  |                   |
//--------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::models::types::{TickerSnapshot, Trade};

/// Errors that can occur in the event system
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to publish an event (channel closed)
    #[error("Failed to publish event: {0}")]
    PublishError(String),
}

/// Type alias for Result with EventError
pub type EventResult<T> = Result<T, EventError>;

/// Represents events announced by the matching service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchingEngineEvent {
    /// Generated when a trade is executed
    TradeExecuted {
        /// The trade that was executed
        trade: Trade,
        /// Timestamp when the event occurred
        timestamp: DateTime<Utc>,
    },

    /// Generated after every matching pass with the refreshed top of book
    TickerUpdated {
        /// Pair the snapshot belongs to
        pair: String,
        /// The new snapshot
        snapshot: TickerSnapshot,
        /// Timestamp when the event occurred
        timestamp: DateTime<Utc>,
    },
}

impl MatchingEngineEvent {
    pub fn trade_executed(trade: Trade) -> Self {
        Self::TradeExecuted {
            trade,
            timestamp: Utc::now(),
        }
    }

    pub fn ticker_updated(pair: impl Into<String>, snapshot: TickerSnapshot) -> Self {
        Self::TickerUpdated {
            pair: pair.into(),
            snapshot,
            timestamp: Utc::now(),
        }
    }

    /// Short name of the variant, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TradeExecuted { .. } => "trade_executed",
            Self::TickerUpdated { .. } => "ticker_updated",
        }
    }
}
