//! Implementation of the event gateway that schedules matching passes and publishes
//! their results to external systems.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    Config,
    domain::{
        models::types::{OrderId, TickerSnapshot, Trade},
        services::{
            matching_engine::{MatchingEngine, MatchingError},
            orderbook::orderbook::OrderBookStore,
        },
    },
};

use super::{EventManagerError, EventPublisher, WakeSignal};

/// Trade publishes attempted per trade once shutdown has begun.
const SHUTDOWN_PUBLISH_ATTEMPTS: u32 = 5;

/// Timing knobs of the gateway tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Timer fallback between passes when no wake arrives.
    pub poll_interval: Duration,
    /// First delay after a retryable failure.
    pub retry_backoff: Duration,
    /// Upper bound for the exponential backoff.
    pub max_backoff: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            retry_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(2000),
        }
    }
}

impl From<&Config> for GatewaySettings {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval,
            retry_backoff: config.retry_backoff,
            max_backoff: config.max_backoff,
        }
    }
}

impl GatewaySettings {
    fn next_backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_backoff)
    }
}

/// Boundary adapter around one pair's matching engine.
///
/// The gateway runs two tasks:
/// 1. the matching loop, woken by [`EventGateway::on_order_arrived`] or by the poll timer,
///    which runs passes to exhaustion and refreshes the ticker;
/// 2. the trade forwarder, which drains the engine's outbox and publishes every trade
///    at least once.
pub struct EventGateway {
    engine: Arc<MatchingEngine>,
    publisher: Arc<dyn EventPublisher>,
    wake: Arc<WakeSignal>,
    settings: GatewaySettings,
    outbox: Mutex<Option<UnboundedReceiver<Trade>>>,
}

/// Join handles of a started gateway.
pub struct GatewayHandle {
    matching: JoinHandle<()>,
    forwarder: JoinHandle<()>,
}

impl GatewayHandle {
    /// Waits for both tasks. The matching loop stops first, then the forwarder drains
    /// whatever trades are still queued.
    pub async fn join(self) {
        if let Err(err) = self.matching.await {
            error!("Matching loop task failed: {}", err);
        }
        if let Err(err) = self.forwarder.await {
            error!("Trade forwarder task failed: {}", err);
        }
    }
}

impl EventGateway {
    /// Creates a gateway for `book`, publishing through `publisher`.
    pub fn new(book: Arc<OrderBookStore>, publisher: Arc<dyn EventPublisher>, settings: GatewaySettings) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        Self {
            engine: Arc::new(MatchingEngine::new(book, outbox_tx)),
            publisher,
            wake: Arc::new(WakeSignal::new()),
            settings,
            outbox: Mutex::new(Some(outbox_rx)),
        }
    }

    pub fn engine(&self) -> &Arc<MatchingEngine> {
        &self.engine
    }

    pub fn wake_signal(&self) -> &Arc<WakeSignal> {
        &self.wake
    }

    /// Requests a matching pass. Safe to call from any task, any number of times.
    pub fn on_order_arrived(&self, order_id: Option<&OrderId>) {
        match order_id {
            Some(id) => debug!(pair = %self.engine.book().pair(), "order {} arrived", id),
            None => debug!(pair = %self.engine.book().pair(), "wake requested"),
        }
        self.wake.notify();
    }

    /// Spawns the matching loop and the trade forwarder.
    ///
    /// Cancelling `cancel` stops the matching loop after its in-flight trade; the forwarder
    /// then publishes the remaining outbox and exits.
    ///
    /// # Errors
    /// `EventManagerError::AlreadyStarted` if called twice.
    pub fn start(&self, cancel: CancellationToken) -> Result<GatewayHandle, EventManagerError> {
        let outbox = self.outbox.lock().take().ok_or(EventManagerError::AlreadyStarted)?;
        let drain = CancellationToken::new();

        info!(pair = %self.engine.book().pair(), "Event gateway starting");
        let matching = tokio::spawn(matching_loop(
            self.engine.clone(),
            self.publisher.clone(),
            self.wake.clone(),
            self.settings,
            cancel,
            drain.clone(),
        ));
        let forwarder = tokio::spawn(trade_forwarder(
            outbox,
            self.publisher.clone(),
            self.settings,
            drain,
        ));

        // Pick up orders that were resident before startup.
        self.wake.notify();
        Ok(GatewayHandle { matching, forwarder })
    }
}

async fn matching_loop(
    engine: Arc<MatchingEngine>,
    publisher: Arc<dyn EventPublisher>,
    wake: Arc<WakeSignal>,
    settings: GatewaySettings,
    cancel: CancellationToken,
    drain: CancellationToken,
) {
    let pair = engine.book().pair().to_string();
    info!(%pair, "Matching loop started");

    let mut backoff = settings.retry_backoff;
    let mut last_trade_price: Option<Decimal> = None;
    let mut published: Option<TickerSnapshot> = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = wake.wait() => {}
            _ = tokio::time::sleep(settings.poll_interval) => {}
        }

        match run_iteration(&engine, &cancel, &mut last_trade_price).await {
            Ok(snapshot) => {
                backoff = settings.retry_backoff;
                if published.as_ref() != Some(&snapshot) {
                    if let Err(err) = publisher.publish_ticker(&pair, &snapshot).await {
                        warn!(%pair, "Dropping ticker update: {}", err);
                    }
                    published = Some(snapshot);
                }
            }
            Err(MatchingError::TradeSinkClosed) => {
                error!(%pair, "Trade outbox closed, stopping matching loop");
                break;
            }
            Err(err) if err.is_retryable() => {
                warn!(%pair, "Matching pass aborted, retrying in {:?}: {}", backoff, err);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = settings.next_backoff(backoff);
                wake.notify();
            }
            Err(err) => error!(%pair, "Matching pass failed: {}", err),
        }
    }

    info!(%pair, "Matching loop stopped");
    drain.cancel();
}

/// Runs one pass and persists the refreshed ticker.
async fn run_iteration(
    engine: &MatchingEngine,
    cancel: &CancellationToken,
    last_trade_price: &mut Option<Decimal>,
) -> Result<TickerSnapshot, MatchingError> {
    let summary = engine.run_pass(cancel).await?;
    if summary.last_trade_price.is_some() {
        *last_trade_price = summary.last_trade_price;
    }

    let book = engine.book();
    let snapshot = book.snapshot_ticker(*last_trade_price).await?;
    book.set_ticker(&snapshot).await?;
    Ok(snapshot)
}

async fn trade_forwarder(
    mut outbox: UnboundedReceiver<Trade>,
    publisher: Arc<dyn EventPublisher>,
    settings: GatewaySettings,
    drain: CancellationToken,
) {
    info!("Trade forwarder started");
    loop {
        tokio::select! {
            biased;
            trade = outbox.recv() => match trade {
                Some(trade) => deliver(&trade, publisher.as_ref(), &settings, &drain).await,
                None => break,
            },
            _ = drain.cancelled() => {
                while let Ok(trade) = outbox.try_recv() {
                    deliver(&trade, publisher.as_ref(), &settings, &drain).await;
                }
                break;
            }
        }
    }
    info!("Trade forwarder stopped");
}

/// Publishes `trade` until it succeeds. Once shutdown has begun the number of attempts is
/// bounded and an undeliverable trade is logged with its dedup key.
async fn deliver(trade: &Trade, publisher: &dyn EventPublisher, settings: &GatewaySettings, drain: &CancellationToken) {
    let mut backoff = settings.retry_backoff;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match publisher.publish_trade(trade).await {
            Ok(()) => {
                debug!("Published trade {}", trade.dedup_key());
                return;
            }
            Err(err) if drain.is_cancelled() && attempts >= SHUTDOWN_PUBLISH_ATTEMPTS => {
                error!("Giving up on trade {} after {} attempts: {}", trade.dedup_key(), attempts, err);
                return;
            }
            Err(err) => {
                warn!("Publishing trade {} failed (attempt {}): {}", trade.dedup_key(), attempts, err);
                tokio::time::sleep(backoff).await;
                backoff = settings.next_backoff(backoff);
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
//  TESTS
//--------------------------------------------------------------------------------------------------
// | Name                                | Description                                          |
// |-------------------------------------|------------------------------------------------------|
// | test_wake_triggers_trade_publish    | Arrival wake leads to a published trade and ticker   |
// | test_trade_publish_is_retried       | Failed trade publishes are retried until success     |
// | test_ticker_failure_is_ignored      | Ticker errors never block trades                     |
// | test_shutdown_drains_outbox         | Queued trades are published before the forwarder ends|
// | test_start_twice                    | Second start is rejected                             |
//--------------------------------------------------------------------------------------------------
