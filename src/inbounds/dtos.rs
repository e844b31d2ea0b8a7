use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::models::types::{Order, OrderId, Side, TypeError};

/// +----------------------------------------------------------+
/// | STRUCTS | TRAITS | ENUMS | FUNCTIONS                     |
/// +----------+-------+-------+------------------------------+
/// | Structs:                                                 |
/// |   - OrderArrivedNotification                             |
/// |   - FundedOrderDto                                       |
/// | Enums:                                                   |
/// |   - NotificationError                                    |
/// | Implementations:                                         |
/// |   - TryFrom<FundedOrderDto> for Order                    |
/// +----------------------------------------------------------+

/// Errors raised while reading a notification body.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotificationError {
    /// The body is not a valid notification document.
    #[error("Malformed notification: {0}")]
    Malformed(String),

    /// The embedded order failed validation.
    #[error("Invalid order in notification: {0}")]
    InvalidOrder(#[from] TypeError),
}

/// "Re-check the book" signal. Every field is optional; an empty body is a plain wake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderArrivedNotification {
    /// Pair the order was funded on. Absent means "whatever pair consumes this queue".
    #[serde(default)]
    pub pair: Option<String>,

    /// Id of the newly funded order, for tracing.
    #[serde(default)]
    pub order_id: Option<String>,

    /// The funded order itself, inserted into the book before matching.
    #[serde(default)]
    pub order: Option<FundedOrderDto>,
}

impl OrderArrivedNotification {
    /// Parses a message body. Empty and whitespace-only bodies are plain wake signals.
    pub fn parse(body: &[u8]) -> Result<Self, NotificationError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body).map_err(|err| NotificationError::Malformed(err.to_string()))
    }

    /// Whether this notification concerns `pair`.
    pub fn is_for(&self, pair: &str) -> bool {
        self.pair.as_deref().is_none_or(|p| p == pair)
    }

    /// Id to trace the wake-up with: the explicit `order_id`, else the embedded order's id.
    pub fn trace_id(&self) -> Option<OrderId> {
        self.order_id
            .as_deref()
            .or_else(|| self.order.as_ref().and_then(|o| o.id.as_deref()))
            .and_then(|id| OrderId::new(id).ok())
    }
}

/// A funded limit order as carried by a notification.
///
/// Decimal fields accept JSON strings or numbers. `priority` defaults to zero, `time`
/// to the moment of ingestion and `id` to a fresh UUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundedOrderDto {
    pub side: Side,
    pub price: Decimal,
    #[serde(default)]
    pub priority: Decimal,
    #[serde(default)]
    pub time: Option<Decimal>,
    pub amount: Decimal,
    #[serde(default)]
    pub id: Option<String>,
}

impl TryFrom<FundedOrderDto> for Order {
    type Error = NotificationError;

    fn try_from(dto: FundedOrderDto) -> Result<Self, Self::Error> {
        let id = dto.id.map(OrderId::new).transpose()?;
        Ok(Order::create(dto.side, dto.price, dto.priority, dto.time, dto.amount, id)?)
    }
}
