// Expose the modules
pub mod config;
pub mod domain;
pub mod inbounds;
pub mod outbounds;

// Re-export key types for easier usage
pub use config::{Config, ConfigError};
pub use domain::models::types::{Order, OrderId, Side, TickerSnapshot, Trade, TypeError};
pub use domain::services::event_manager::{
    EventGateway, EventManagerError, EventPublisher, GatewayHandle, GatewaySettings, WakeSignal,
};
pub use domain::services::events::{EventBus, EventError, EventResult, MatchingEngineEvent};
pub use domain::services::matching_engine::{EngineState, MatchingEngine, MatchingError, PassSummary};
pub use domain::services::orderbook::OrderbookError;
pub use domain::services::orderbook::memory_store::MemoryStore;
pub use domain::services::orderbook::orderbook::{OrderBookStore, UpdateOutcome};
pub use domain::services::orderbook::store::OrderedStore;
