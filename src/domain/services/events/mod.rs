//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// In-process event distribution for the matching service. Trades and ticker snapshots produced
// by the gateway can be fanned out to any number of local subscribers without a broker.
//
// | Component                | Description                                                |
// |--------------------------|------------------------------------------------------------|
// | MatchingEngineEvent      | Enum of everything the service announces                   |
// | EventBus                 | Broadcast hub for publishing and subscribing to events     |
//--------------------------------------------------------------------------------------------------

mod event_bus;
mod event_types;


// Re-exports
pub use event_bus::EventBus;
pub use event_types::{EventError, EventResult, MatchingEngineEvent};
