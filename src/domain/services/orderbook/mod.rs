use thiserror::Error;

use crate::domain::models::types::OrderId;

pub mod keys;
pub mod memory_store;
pub mod orderbook;
pub mod priority_key;
pub mod store;

use self::priority_key::KeyError;
use self::store::StoreError;

/// Errors that can occur within the order book service.
///
/// `StoreUnavailable` and `Conflict` are transient: callers retry the whole
/// operation and must not assume any part of it was applied.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrderbookError {
    /// The backing store could not be reached.
    #[error("Order book store unavailable: {0}")]
    StoreUnavailable(String),

    /// A stored entry could not be decoded.
    #[error("Malformed book entry: {0}")]
    MalformedKey(KeyError),

    /// The order cannot be written to the book.
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// No ticker snapshot was ever published for this pair.
    #[error("No ticker available for pair {0}")]
    TickerUnavailable(String),

    /// Concurrent writers kept replacing the entry being updated.
    #[error("Order {0} kept changing while being updated")]
    Conflict(OrderId),

    /// Ticker payload could not be (de)serialized.
    #[error("Ticker serialization error: {0}")]
    Serialization(String),
}

impl OrderbookError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Conflict(_))
    }
}

impl From<StoreError> for OrderbookError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => Self::StoreUnavailable(reason),
        }
    }
}
