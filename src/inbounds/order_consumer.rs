//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Consumes order-arrival notifications. A notification carrying a funded order admits it into
// the book once per order id, so broker redeliveries are harmless; every notification for this
// pair then wakes the matching loop.
//
// | Function               | Description                                        | Return Type            |
// |------------------------|----------------------------------------------------|------------------------|
// | handle_notification    | Applies one message body to the book and gateway   | Result<Handled, ..>    |
// | run_order_consumer     | Broker loop with ack / requeue decisions           | ()                     |
//--------------------------------------------------------------------------------------------------

use rabbitmq::Subscription;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dtos::{NotificationError, OrderArrivedNotification};
use crate::domain::models::types::{Order, OrderId};
use crate::domain::services::event_manager::EventGateway;
use crate::domain::services::orderbook::OrderbookError;

/// What a notification ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// Plain wake signal.
    Woken,
    /// The carried order was inserted, then the loop was woken.
    Inserted(Order),
    /// The carried order's id was admitted before; nothing was inserted.
    Duplicate(OrderId),
    /// The notification was for another pair.
    Ignored,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    #[error(transparent)]
    Notification(#[from] NotificationError),

    #[error(transparent)]
    Orderbook(#[from] OrderbookError),
}

impl ConsumerError {
    /// Whether the message should be redelivered rather than dropped.
    pub fn should_requeue(&self) -> bool {
        match self {
            Self::Notification(_) => false,
            Self::Orderbook(err) => err.is_retryable(),
        }
    }
}

/// Applies one notification body.
pub async fn handle_notification(body: &[u8], gateway: &EventGateway) -> Result<Handled, ConsumerError> {
    let notification = OrderArrivedNotification::parse(body)?;
    let book = gateway.engine().book();
    if !notification.is_for(book.pair()) {
        debug!("Ignoring notification for pair {:?}", notification.pair);
        return Ok(Handled::Ignored);
    }

    let trace_id = notification.trace_id();
    let handled = match notification.order {
        Some(dto) => {
            let order = Order::try_from(dto)?;
            if book.admit(order.clone()).await? {
                Handled::Inserted(order)
            } else {
                Handled::Duplicate(order.id)
            }
        }
        None => Handled::Woken,
    };
    gateway.on_order_arrived(trace_id.as_ref());
    Ok(handled)
}

/// Consumes `subscription` until `cancel` fires or the broker closes the channel.
///
/// Handled and malformed messages are acknowledged; messages that failed on a transient
/// store error are returned to the queue.
pub async fn run_order_consumer(mut subscription: Subscription, gateway: &EventGateway, cancel: CancellationToken) {
    info!("Consuming order notifications from {}", subscription.queue_name());
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = subscription.receive() => match message {
                Some(message) => message,
                None => {
                    warn!("Order notification channel closed");
                    break;
                }
            },
        };

        let body = message.content.as_deref().unwrap_or_default();
        let result = handle_notification(body, gateway).await;
        let ack = match &result {
            Ok(handled) => {
                debug!("Notification handled: {:?}", handled);
                subscription.ack(&message).await
            }
            Err(err) if err.should_requeue() => {
                warn!("Requeueing notification: {}", err);
                subscription.reject(&message, true).await
            }
            Err(err) => {
                error!("Dropping notification: {}", err);
                subscription.ack(&message).await
            }
        };
        if let Err(err) = ack {
            error!("Failed to settle notification: {}", err);
        }
    }

    if let Err(err) = subscription.close().await {
        warn!("Error closing order subscription: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rust_decimal_macros::dec;

    use crate::domain::models::types::Side;
    use crate::domain::services::event_manager::{GatewaySettings, MockEventPublisher};
    use crate::domain::services::orderbook::memory_store::MemoryStore;
    use crate::domain::services::orderbook::orderbook::OrderBookStore;

    fn gateway() -> EventGateway {
        let book = Arc::new(OrderBookStore::new("BTCUSD", Arc::new(MemoryStore::new())));
        EventGateway::new(book, Arc::new(MockEventPublisher::new()), GatewaySettings::default())
    }

    #[tokio::test]
    async fn test_plain_wake() {
        let gateway = gateway();
        assert_eq!(handle_notification(b"", &gateway).await.unwrap(), Handled::Woken);
        assert!(gateway.wake_signal().is_pending());
    }

    #[tokio::test]
    async fn test_funded_order_is_inserted() {
        let gateway = gateway();
        let body = br#"{"pair": "BTCUSD", "order": {"side": "ask", "price": "240", "amount": "0.1", "id": "B"}}"#;
        let handled = handle_notification(body, &gateway).await.unwrap();
        assert!(matches!(handled, Handled::Inserted(ref order) if order.id.as_str() == "B"));

        let best = gateway.engine().book().peek_best(Side::Ask).await.unwrap().unwrap();
        assert_eq!(best.price, dec!(240));
        assert!(gateway.wake_signal().is_pending());
    }

    #[tokio::test]
    async fn test_redelivery_is_admitted_once() {
        let gateway = gateway();
        // No `time`, so every delivery gets its own timestamp.
        let body = br#"{"order": {"side": "ask", "price": "240", "amount": "1", "id": "B"}}"#;

        assert!(matches!(handle_notification(body, &gateway).await.unwrap(), Handled::Inserted(_)));
        let handled = handle_notification(body, &gateway).await.unwrap();
        assert!(matches!(handled, Handled::Duplicate(ref id) if id.as_str() == "B"));

        let asks = gateway.engine().book().entries(Side::Ask).await.unwrap();
        assert_eq!(asks.len(), 1);
        assert_eq!(asks[0].amount, dec!(1));
        assert!(gateway.wake_signal().is_pending());
    }

    #[tokio::test]
    async fn test_other_pair_is_ignored() {
        let gateway = gateway();
        let body = br#"{"pair": "ETHUSD", "order": {"side": "ask", "price": "1", "amount": "1"}}"#;
        assert_eq!(handle_notification(body, &gateway).await.unwrap(), Handled::Ignored);
        assert_eq!(gateway.engine().book().len(Side::Ask).await.unwrap(), 0);
        assert!(!gateway.wake_signal().is_pending());
    }

    #[tokio::test]
    async fn test_malformed_is_not_requeued() {
        let gateway = gateway();
        let err = handle_notification(b"{oops", &gateway).await.unwrap_err();
        assert!(!err.should_requeue());
        assert!(ConsumerError::from(OrderbookError::StoreUnavailable("down".into())).should_requeue());
    }
}
