//! Trade events published on every match.

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::domain::models::types::Trade;
use crate::domain::services::event_manager::EventManagerError;

/// Wire form of an executed trade: `{pair, price, amount, bid_id, ask_id}`.
///
/// Prices and amounts are JSON numbers. Consumers deduplicate on
/// `(bid_id, ask_id, price, amount)`, which `dedup_key` carries verbatim.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TradeEvent {
    pub pair: String,
    pub price: f64,
    pub amount: f64,
    pub bid_id: String,
    pub ask_id: String,
}

impl TryFrom<&Trade> for TradeEvent {
    type Error = EventManagerError;

    fn try_from(trade: &Trade) -> Result<Self, Self::Error> {
        let number = |field: &str, value: rust_decimal::Decimal| {
            value.to_f64().ok_or_else(|| {
                EventManagerError::SerializationError(format!("{} {} is not representable", field, value))
            })
        };

        Ok(Self {
            pair: trade.pair.clone(),
            price: number("price", trade.price)?,
            amount: number("amount", trade.amount)?,
            bid_id: trade.bid_id.to_string(),
            ask_id: trade.ask_id.to_string(),
        })
    }
}
