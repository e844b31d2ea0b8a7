//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Keeps the service attached to RabbitMQ. A session is one connection with the event publisher
// attached to it and the order queue subscribed. When the connection drops, the session is torn
// down and reopened after a backoff, while the gateway keeps running and buffers trades.
//
// | Name                | Description                                          | Return Type        |
// |---------------------|------------------------------------------------------|--------------------|
// | ReconnectPolicy     | Initial and maximum reconnect delay                  | -                  |
// | run_broker_session  | Consume with reconnects until cancelled              | Option<RabbitMQ>   |
//--------------------------------------------------------------------------------------------------

use std::time::Duration;

use rabbitmq::{RabbitMQ, Subscription};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::order_consumer::run_order_consumer;
use crate::Config;
use crate::domain::services::event_manager::{EventGateway, EventManagerError};
use crate::outbounds::RabbitEventPublisher;

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl From<&Config> for ReconnectPolicy {
    fn from(config: &Config) -> Self {
        Self {
            initial: config.reconnect_delay,
            max: config.max_reconnect_delay,
        }
    }
}

impl ReconnectPolicy {
    pub fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

/// Consumes the order queue, reopening the broker session whenever it is lost.
///
/// Returns once `cancel` fires. If a session is open at that point its connection is
/// returned with `publisher` still attached, so that queued trades can be flushed before
/// the caller closes it.
pub async fn run_broker_session(
    config: &Config,
    gateway: &EventGateway,
    publisher: &RabbitEventPublisher,
    cancel: CancellationToken,
) -> Option<RabbitMQ> {
    let policy = ReconnectPolicy::from(config);
    let mut delay = policy.initial;

    loop {
        match open_session(config, publisher).await {
            Ok((rabbit, subscription)) => {
                info!("RabbitMQ session open");
                delay = policy.initial;
                run_order_consumer(subscription, gateway, cancel.clone()).await;
                if cancel.is_cancelled() {
                    return Some(rabbit);
                }

                warn!("RabbitMQ session lost, reopening in {:?}", delay);
                publisher.detach();
                if let Err(err) = rabbit.close().await {
                    debug!("Closing the lost connection failed: {}", err);
                }
            }
            Err(err) => {
                publisher.detach();
                warn!("RabbitMQ unavailable, retrying in {:?}: {}", delay, err);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = policy.next_delay(delay);
    }
}

async fn open_session(
    config: &Config,
    publisher: &RabbitEventPublisher,
) -> Result<(RabbitMQ, Subscription), EventManagerError> {
    let rabbit = RabbitMQ::connect(&config.rabbit_url, &config.app_id)
        .await
        .map_err(|err| EventManagerError::RabbitMQError(err.to_string()))?;

    let subscribed = async {
        publisher.attach(&rabbit).await?;
        rabbit
            .subscribe(&config.order_queue)
            .await
            .map_err(|err| EventManagerError::RabbitMQError(err.to_string()))
    }
    .await;

    match subscribed {
        Ok(subscription) => Ok((rabbit, subscription)),
        Err(err) => {
            if let Err(close_err) = rabbit.close().await {
                debug!("Closing the half-open connection failed: {}", close_err);
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::domain::services::events::EventBus;
    use crate::domain::services::orderbook::memory_store::MemoryStore;
    use crate::domain::services::orderbook::orderbook::OrderBookStore;
    use crate::domain::services::event_manager::GatewaySettings;
    use crate::outbounds::BusEventPublisher;

    #[test]
    fn test_reconnect_backoff_is_capped() {
        let policy = ReconnectPolicy {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(12),
        };
        assert_eq!(policy.next_delay(Duration::from_secs(5)), Duration::from_secs(10));
        assert_eq!(policy.next_delay(Duration::from_secs(10)), Duration::from_secs(12));
        assert_eq!(ReconnectPolicy::from(&Config::default()).initial, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_keeps_retrying_until_cancelled() {
        let config = Config {
            rabbit_url: "not a uri".to_string(),
            reconnect_delay: Duration::from_millis(5),
            max_reconnect_delay: Duration::from_millis(10),
            ..Config::default()
        };
        let book = Arc::new(OrderBookStore::new("BTCUSD", Arc::new(MemoryStore::new())));
        let gateway = EventGateway::new(
            book,
            Arc::new(BusEventPublisher::new(EventBus::new(4))),
            GatewaySettings::default(),
        );
        let publisher = RabbitEventPublisher::new(&config);

        let cancel = CancellationToken::new();
        let session = run_broker_session(&config, &gateway, &publisher, cancel.clone());
        let stopper = async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            cancel.cancel();
        };
        let (rabbit, ()) = tokio::time::timeout(Duration::from_secs(2), async { tokio::join!(session, stopper) })
            .await
            .unwrap();

        assert!(rabbit.is_none());
        assert!(!publisher.is_attached());
    }
}
