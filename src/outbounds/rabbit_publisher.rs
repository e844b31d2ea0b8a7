//! `EventPublisher` backed by RabbitMQ fanout exchanges.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rabbitmq::{Message, Publisher, PublisherContext, PublisherMode, RabbitMQ};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{market::TickerEvent, trade::TradeEvent};
use crate::Config;
use crate::domain::models::types::{TickerSnapshot, Trade};
use crate::domain::services::event_manager::{EventManagerError, EventPublisher};

/// Publishers declared on one broker connection.
struct Links {
    trades: Publisher,
    ticker: Publisher,
}

/// Publishes trades to the trade exchange and tickers to the ticker exchange.
///
/// The publisher outlives broker connections: [`RabbitEventPublisher::attach`] binds it to a
/// fresh connection and [`RabbitEventPublisher::detach`] unbinds it when that connection is
/// lost. While detached every publish fails, so the gateway keeps retrying trades until a
/// connection is attached again.
///
/// Trades are sent inline so that a broker failure is reported back to the gateway.
/// Tickers go through the publisher's background task and are never retried.
pub struct RabbitEventPublisher {
    trade_exchange: String,
    ticker_exchange: String,
    links: RwLock<Option<Arc<Links>>>,
}

impl RabbitEventPublisher {
    /// Creates a detached publisher for the exchanges named in `config`.
    pub fn new(config: &Config) -> Self {
        Self {
            trade_exchange: config.trade_exchange.clone(),
            ticker_exchange: config.ticker_exchange.clone(),
            links: RwLock::new(None),
        }
    }

    /// Declares both exchanges on `rabbit` and routes every later publish through it.
    pub async fn attach(&self, rabbit: &RabbitMQ) -> Result<(), EventManagerError> {
        let trades = rabbit
            .publisher(&self.trade_exchange, PublisherMode::Broadcast)
            .await
            .map_err(|err| EventManagerError::RabbitMQError(err.to_string()))?;
        let ticker = rabbit
            .publisher(&self.ticker_exchange, PublisherMode::Broadcast)
            .await
            .map_err(|err| EventManagerError::RabbitMQError(err.to_string()))?;
        info!(
            "Publishing trades to {} and tickers to {}",
            trades.name(),
            ticker.name()
        );
        *self.links.write() = Some(Arc::new(Links { trades, ticker }));
        Ok(())
    }

    /// Stops publishing through the current connection, if any.
    pub fn detach(&self) {
        if self.links.write().take().is_some() {
            warn!("Event publisher detached from RabbitMQ");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.links.read().is_some()
    }

    /// Closes both publishers of the current connection.
    pub async fn close(&self) -> Result<(), EventManagerError> {
        let Some(links) = self.links.write().take() else {
            return Ok(());
        };
        let Ok(Links { trades, ticker }) = Arc::try_unwrap(links) else {
            warn!("Publishers still in use at shutdown, skipping close");
            return Ok(());
        };
        trades
            .close()
            .await
            .map_err(|err| EventManagerError::RabbitMQError(err.to_string()))?;
        ticker
            .close()
            .await
            .map_err(|err| EventManagerError::RabbitMQError(err.to_string()))
    }

    fn links(&self) -> Result<Arc<Links>, EventManagerError> {
        self.links
            .read()
            .clone()
            .ok_or_else(|| EventManagerError::PublishError("not connected to RabbitMQ".to_string()))
    }
}

#[async_trait]
impl EventPublisher for RabbitEventPublisher {
    async fn publish_trade(&self, trade: &Trade) -> Result<(), EventManagerError> {
        let event = TradeEvent::try_from(trade)?;
        let body = serde_json::to_vec(&event)
            .map_err(|err| EventManagerError::SerializationError(err.to_string()))?;
        // The dedup key doubles as message id so redeliveries are recognisable.
        let ctx = PublisherContext::new(&Uuid::new_v4().to_string(), Some(trade.dedup_key()));

        self.links()?
            .trades
            .send(Message::new(body), ctx)
            .await
            .map_err(|err| EventManagerError::PublishError(err.to_string()))?;
        debug!("Sent trade {}", trade.dedup_key());
        Ok(())
    }

    async fn publish_ticker(&self, pair: &str, snapshot: &TickerSnapshot) -> Result<(), EventManagerError> {
        let body = serde_json::to_vec(&TickerEvent::new(pair, snapshot))
            .map_err(|err| EventManagerError::SerializationError(err.to_string()))?;
        let ctx = PublisherContext::new(&Uuid::new_v4().to_string(), None);
        self.links()?
            .ticker
            .publish(Message::new(body), ctx)
            .map_err(|err| EventManagerError::PublishError(err.to_string()))
    }
}
