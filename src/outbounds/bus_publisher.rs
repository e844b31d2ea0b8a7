//! `EventPublisher` that announces on the in-process `EventBus`.

use async_trait::async_trait;
use tracing::debug;

use crate::domain::models::types::{TickerSnapshot, Trade};
use crate::domain::services::event_manager::{EventManagerError, EventPublisher};
use crate::domain::services::events::{EventBus, MatchingEngineEvent};

/// Publishes trades and tickers to local subscribers only. Used in demo mode and tests.
#[derive(Debug, Clone)]
pub struct BusEventPublisher {
    bus: EventBus,
}

impl BusEventPublisher {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl EventPublisher for BusEventPublisher {
    async fn publish_trade(&self, trade: &Trade) -> Result<(), EventManagerError> {
        let delivered = self
            .bus
            .publish(MatchingEngineEvent::trade_executed(trade.clone()))
            .map_err(|err| EventManagerError::PublishError(err.to_string()))?;
        debug!("Trade {} delivered to {} subscribers", trade.dedup_key(), delivered);
        Ok(())
    }

    async fn publish_ticker(&self, pair: &str, snapshot: &TickerSnapshot) -> Result<(), EventManagerError> {
        self.bus
            .publish(MatchingEngineEvent::ticker_updated(pair, snapshot.clone()))
            .map(|_| ())
            .map_err(|err| EventManagerError::PublishError(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::types::OrderId;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_forwards_to_bus() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let publisher = BusEventPublisher::new(bus);

        let trade = Trade {
            pair: "BTCUSD".into(),
            price: dec!(240),
            amount: dec!(0.1),
            bid_id: OrderId::new("A").unwrap(),
            ask_id: OrderId::new("B").unwrap(),
        };
        publisher.publish_trade(&trade).await.unwrap();
        publisher
            .publish_ticker("BTCUSD", &TickerSnapshot::default())
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            MatchingEngineEvent::TradeExecuted { trade: t, .. } if t == trade
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            MatchingEngineEvent::TickerUpdated { pair, .. } if pair == "BTCUSD"
        ));
    }
}
