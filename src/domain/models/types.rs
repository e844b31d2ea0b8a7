//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module defines the core data types used throughout the matching engine,
// including orders, trades and ticker snapshots.
//
// | Section            | Description                                                      |
// |--------------------|------------------------------------------------------------------|
// | ENUMS              | Side of the book.                                                |
// | STRUCTS            | OrderId, Order, Trade, TickerSnapshot.                           |
// | Potential Errors   | Defines errors related to type handling.                         |
// | TESTS              | Contains unit tests for the defined types.                       |
//--------------------------------------------------------------------------------------------------

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Character joining the fields of an encoded book member. Never allowed inside an order id.
pub const MEMBER_SEP: char = '|';

//--------------------------------------------------------------------------------------------------
//  ENUMS
//--------------------------------------------------------------------------------------------------

/// Represents the side of an order (Buy or Sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// A buy order.
    Bid,
    /// A sell order.
    Ask,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bid => "bid",
            Self::Ask => "ask",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bid" | "buy" => Ok(Self::Bid),
            "ask" | "sell" => Ok(Self::Ask),
            other => Err(TypeError::InvalidSide(other.to_string())),
        }
    }
}

//--------------------------------------------------------------------------------------------------
//  STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name           | Description                                              |
// |----------------|----------------------------------------------------------|
// | OrderId        | Opaque order identity, stable across partial fills.      |
// | Order          | Immutable funded limit order resident on the book.       |
// | Trade          | A completed match between a bid and an ask.              |
// | TickerSnapshot | Best bid / best ask / last trade summary.                |
//--------------------------------------------------------------------------------------------------

/// Opaque, unique order identifier.
///
/// Any non-empty string is accepted as long as it does not contain [`MEMBER_SEP`],
/// since the id is the last field of the encoded book member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderId(String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Result<Self, TypeError> {
        let id = id.into();
        if id.is_empty() {
            return Err(TypeError::InvalidOrderId(id));
        }
        if id.contains(MEMBER_SEP) {
            return Err(TypeError::InvalidOrderId(id));
        }
        Ok(Self(id))
    }

    /// Generates a fresh random id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for OrderId {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OrderId> for String {
    fn from(id: OrderId) -> Self {
        id.0
    }
}

impl FromStr for OrderId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// A funded limit order as stored in the book.
///
/// Orders are value objects. A partial fill never mutates an order; it produces
/// a new `Order` with the same `id` and a reduced `amount` (see [`Order::with_amount`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Side of the order (bid or ask).
    pub side: Side,
    /// Limit price.
    pub price: Decimal,
    /// Queue priority hint; lower values rank first in the shared ordering.
    pub priority: Decimal,
    /// Submission timestamp (unix seconds, fractional).
    pub time: Decimal,
    /// Remaining quantity, always strictly positive while resident.
    pub amount: Decimal,
    /// Stable identity across partial fills.
    pub id: OrderId,
}

impl Order {
    /// Creates a validated order.
    ///
    /// # Errors
    /// * `TypeError::InvalidQuantity` if `amount <= 0`
    /// * `TypeError::InvalidPrice` if `price < 0`
    /// * `TypeError::InvalidTime` if `time < 0`
    pub fn new(
        side: Side,
        price: Decimal,
        priority: Decimal,
        time: Decimal,
        amount: Decimal,
        id: OrderId,
    ) -> Result<Self, TypeError> {
        if amount <= Decimal::ZERO {
            return Err(TypeError::InvalidQuantity(amount.to_string()));
        }
        if price.is_sign_negative() && !price.is_zero() {
            return Err(TypeError::InvalidPrice(price.to_string()));
        }
        if time.is_sign_negative() && !time.is_zero() {
            return Err(TypeError::InvalidTime(time.to_string()));
        }
        Ok(Self {
            side,
            price,
            priority,
            time,
            amount,
            id,
        })
    }

    /// Creates an order, filling in a random id and the current time when absent.
    pub fn create(
        side: Side,
        price: Decimal,
        priority: Decimal,
        time: Option<Decimal>,
        amount: Decimal,
        id: Option<OrderId>,
    ) -> Result<Self, TypeError> {
        let time = time.unwrap_or_else(now_timestamp);
        let id = id.unwrap_or_else(OrderId::random);
        Self::new(side, price, priority, time, amount, id)
    }

    /// Returns the residual of this order carrying `amount`, keeping every other field.
    pub fn with_amount(&self, amount: Decimal) -> Result<Self, TypeError> {
        Self::new(
            self.side,
            self.price,
            self.priority,
            self.time,
            amount,
            self.id.clone(),
        )
    }
}

/// Current wall-clock time as fractional unix seconds (microsecond precision).
pub fn now_timestamp() -> Decimal {
    Decimal::new(Utc::now().timestamp_micros(), 6)
}

/// Represents a completed trade resulting from matching a bid against an ask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Trading pair the trade belongs to.
    pub pair: String,
    /// Execution price (the passive order's price).
    pub price: Decimal,
    /// Filled quantity.
    pub amount: Decimal,
    /// Id of the bid that was matched.
    pub bid_id: OrderId,
    /// Id of the ask that was matched.
    pub ask_id: OrderId,
}

impl Trade {
    /// Deterministic key downstream consumers use to drop redelivered trades.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}{sep}{}",
            self.bid_id,
            self.ask_id,
            self.price.normalize(),
            self.amount.normalize(),
            sep = MEMBER_SEP
        )
    }
}

/// Read-side summary of the book recomputed after each matching pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub last_trade_price: Option<Decimal>,
}

//--------------------------------------------------------------------------------------------------
//  Potential Errors
//--------------------------------------------------------------------------------------------------
/// Represents errors that can occur during type validation or conversion within this module.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    /// Occurs when attempting to create a `Side` from an unrecognized string.
    #[error("Invalid side specified: {0}")]
    InvalidSide(String),

    /// Occurs when an order id is empty or contains the member separator.
    #[error("Invalid order id: {0:?}")]
    InvalidOrderId(String),

    /// Occurs when an invalid quantity is specified (zero or negative).
    #[error("Invalid quantity specified: {0}")]
    InvalidQuantity(String),

    /// Occurs when a negative price is specified.
    #[error("Invalid price specified: {0}")]
    InvalidPrice(String),

    /// Occurs when a negative timestamp is specified.
    #[error("Invalid time specified: {0}")]
    InvalidTime(String),
}

//--------------------------------------------------------------------------------------------------
//  TESTS
//--------------------------------------------------------------------------------------------------
// | Name                          | Description                                      |
// |-------------------------------|--------------------------------------------------|
// | test_order_creation           | Verify validated Order construction.             |
// | test_order_rejects_bad_values | Zero amount, negative price, bad ids.            |
// | test_residual_keeps_identity  | with_amount keeps id/priority/time/price.        |
// | test_side_parsing             | Side string round trip and aliases.              |
// | test_trade_dedup_key          | Dedup key ignores trailing zeros.                |
//--------------------------------------------------------------------------------------------------
