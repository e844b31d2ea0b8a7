//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module implements a central event bus for the matching service using tokio's broadcast
// channel. It lets local components observe trades and ticker updates without a broker.
//
// | Component     | Description                                                 |
// |---------------|-------------------------------------------------------------|
// | EventBus      | Central event bus for publishing and subscribing to events  |
//
//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name          | Description                                   | Key Methods                   |
// |---------------|-----------------------------------------------|-------------------------------|
// | EventBus      | Central event publishing component            | publish, subscribe            |
//
//--------------------------------------------------------------------------------------------------

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::event_types::{EventError, EventResult, MatchingEngineEvent};

/// Default number of events buffered per subscriber.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Central event bus for publishing and subscribing to events throughout the service.
///
/// Every subscriber receives every event published after it subscribed. A subscriber
/// that falls more than `capacity` events behind skips the oldest ones and is told how
/// many it missed.
#[derive(Debug, Clone)]
pub struct EventBus {
    /// Channel for broadcasting events to all subscribers
    sender: broadcast::Sender<MatchingEngineEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified capacity.
    ///
    /// # Arguments
    ///
    /// * `capacity` - The maximum number of events that can be queued before
    ///   older events are dropped. Must be greater than zero.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        info!("Created new EventBus with capacity: {}", capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// If there are no subscribers, the event is simply dropped and
    /// the method returns successfully.
    ///
    /// # Returns
    ///
    /// The number of subscribers the event was delivered to.
    pub fn publish(&self, event: MatchingEngineEvent) -> EventResult<usize> {
        if self.sender.receiver_count() == 0 {
            debug!("No subscribers for {} event", event.kind());
            return Ok(0);
        }

        debug!("Publishing {} event", event.kind());
        self.sender.send(event).map_err(|e| {
            error!("Failed to publish event: {}", e);
            EventError::PublishError(e.to_string())
        })
    }

    /// Creates a new subscription to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<MatchingEngineEvent> {
        debug!(
            "New subscriber added to EventBus (total: {})",
            self.sender.receiver_count() + 1
        );
        self.sender.subscribe()
    }

    /// Returns the current number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
