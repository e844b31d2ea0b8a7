//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module is the boundary between the matching engine and the outside world. It turns
// order-arrival notifications into matching passes and hands the results to an EventPublisher.
//
// Core components:
// - WakeSignal: coalescing "re-check the book" flag set by arrival handlers
// - EventGateway: owns the matching loop and the trade forwarder tasks
// - EventPublisher: outbound port implemented by the broker and in-process adapters
//--------------------------------------------------------------------------------------------------

// Service implementation
pub mod event_manager_service;
pub mod wake_signal;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::models::types::{TickerSnapshot, Trade};

pub use self::event_manager_service::{EventGateway, GatewayHandle, GatewaySettings};
pub use self::wake_signal::WakeSignal;

/// Errors that can occur in the event manager service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventManagerError {
    /// Error when publishing events
    #[error("Error publishing event: {0}")]
    PublishError(String),

    /// Error when serializing events
    #[error("Error serializing event: {0}")]
    SerializationError(String),

    /// Error in RabbitMQ connection
    #[error("RabbitMQ connection error: {0}")]
    RabbitMQError(String),

    /// The gateway tasks were already spawned
    #[error("Event gateway already started")]
    AlreadyStarted,
}

/// Outbound port for everything the matching service announces.
///
/// `publish_trade` must not report success before the trade was handed to the transport;
/// the gateway retries failed trade publishes. `publish_ticker` failures are only logged.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes one executed trade.
    async fn publish_trade(&self, trade: &Trade) -> Result<(), EventManagerError>;

    /// Publishes the refreshed ticker of `pair`.
    async fn publish_ticker(&self, pair: &str, snapshot: &TickerSnapshot) -> Result<(), EventManagerError>;
}

#[cfg(test)]
use mockall::*;

#[cfg(test)]
mock! {
    pub EventPublisher {}

    #[async_trait]
    impl EventPublisher for EventPublisher {
        async fn publish_trade(&self, trade: &Trade) -> Result<(), EventManagerError>;

        async fn publish_ticker(&self, pair: &str, snapshot: &TickerSnapshot) -> Result<(), EventManagerError>;
    }
}
