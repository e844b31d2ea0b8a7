//! Market data events published after every matching pass.

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::domain::models::types::TickerSnapshot;

/// Top-of-book summary: `{pair, best_bid, best_ask, last_trade_price}` with `null` for
/// absent values.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TickerEvent {
    pub pair: String,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub last_trade_price: Option<f64>,
}

impl TickerEvent {
    pub fn new(pair: &str, snapshot: &TickerSnapshot) -> Self {
        Self {
            pair: pair.to_string(),
            best_bid: snapshot.best_bid.and_then(|p| p.to_f64()),
            best_ask: snapshot.best_ask.and_then(|p| p.to_f64()),
            last_trade_price: snapshot.last_trade_price.and_then(|p| p.to_f64()),
        }
    }
}
