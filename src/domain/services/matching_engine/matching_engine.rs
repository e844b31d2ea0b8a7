//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module implements the matching loop for one trading pair. It repeatedly takes the best
// bid and best ask from the order book and crosses them until the book no longer crosses.
//
// | Component                | Description                                                |
// |--------------------------|------------------------------------------------------------|
// | MatchingEngine           | Drives matching passes over an OrderBookStore              |
// | EngineState              | Idle between passes, Matching while a pass runs            |
// | PassSummary              | Trades produced by one pass and the last execution price   |
//
//--------------------------------------------------------------------------------------------------
// FUNCTIONS
//--------------------------------------------------------------------------------------------------
// | Name                    | Description                                       | Return Type      |
// |-------------------------|---------------------------------------------------|------------------|
// | match_once              | Executes at most one trade                        | Option<Trade>    |
// | run_pass                | Matches until the book no longer crosses          | PassSummary      |
// | execution_price         | Price of the order that rested first              | Decimal          |
//--------------------------------------------------------------------------------------------------

use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::MatchingError;
use crate::domain::models::types::{Order, Side, Trade};
use crate::domain::services::orderbook::OrderbookError;
use crate::domain::services::orderbook::orderbook::OrderBookStore;

/// Type alias for Result with MatchingError
pub type MatchingResult<T> = Result<T, MatchingError>;

/// Commits attempted by one `match_once` before reporting a conflict.
const MAX_COMMIT_ATTEMPTS: usize = 8;

/// Whether the engine is currently inside a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Matching,
}

/// Outcome of one [`MatchingEngine::run_pass`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Number of trades executed.
    pub trades: usize,
    /// Execution price of the last trade, if any.
    pub last_trade_price: Option<Decimal>,
}

/// Continuous double-auction matcher for a single pair.
///
/// # Matching rule
///
/// * The best bid is the bid side's top entry, the best ask the ask side's bottom entry.
/// * The book crosses while `ask.price <= bid.price`.
/// * A cross fills `min(bid.amount, ask.amount)` at the price of the order with the
///   smaller `(priority, time)`; ties go to the bid.
/// * Both book mutations of a fill commit together, then the trade is handed to the
///   outbox. Consumers of the outbox see every committed trade exactly once.
pub struct MatchingEngine {
    book: Arc<OrderBookStore>,
    outbox: UnboundedSender<Trade>,
    state: RwLock<EngineState>,
}

impl MatchingEngine {
    /// Creates an engine emitting trades into `outbox`.
    pub fn new(book: Arc<OrderBookStore>, outbox: UnboundedSender<Trade>) -> Self {
        Self {
            book,
            outbox,
            state: RwLock::new(EngineState::Idle),
        }
    }

    pub fn book(&self) -> &Arc<OrderBookStore> {
        &self.book
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Executes at most one trade.
    ///
    /// Returns `None` when either side is empty or the best orders do not cross. When the
    /// commit loses a race against another writer, the top of book is read again, at most
    /// [`MAX_COMMIT_ATTEMPTS`] times; after that the retryable `Conflict` is returned.
    pub async fn match_once(&self) -> MatchingResult<Option<Trade>> {
        let mut attempts = 0;
        loop {
            let Some(bid) = self.book.peek_best(Side::Bid).await? else {
                return Ok(None);
            };
            let Some(ask) = self.book.peek_best(Side::Ask).await? else {
                return Ok(None);
            };
            if ask.price > bid.price {
                return Ok(None);
            }

            // Nothing may be committed once trades can no longer be delivered.
            if self.outbox.is_closed() {
                return Err(MatchingError::TradeSinkClosed);
            }

            let amount = bid.amount.min(ask.amount);
            if !self.book.commit_match(&bid, &ask, amount).await? {
                attempts += 1;
                if attempts >= MAX_COMMIT_ATTEMPTS {
                    warn!(bid = %bid.id, ask = %ask.id, "top of book kept changing, giving up this iteration");
                    return Err(OrderbookError::Conflict(bid.id).into());
                }
                debug!(bid = %bid.id, ask = %ask.id, attempts, "top of book changed during commit, retrying");
                continue;
            }

            let trade = Trade {
                pair: self.book.pair().to_string(),
                price: execution_price(&bid, &ask),
                amount,
                bid_id: bid.id,
                ask_id: ask.id,
            };
            debug!(
                "trade {} x {} @ {} between bid {} and ask {}",
                trade.pair, trade.amount, trade.price, trade.bid_id, trade.ask_id
            );
            self.outbox
                .send(trade.clone())
                .map_err(|_| MatchingError::TradeSinkClosed)?;
            return Ok(Some(trade));
        }
    }

    /// Matches until the book no longer crosses or `cancel` fires.
    ///
    /// Cancellation is checked between trades, so a fill in progress always completes.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> MatchingResult<PassSummary> {
        *self.state.write() = EngineState::Matching;
        let result = self.drain(cancel).await;
        *self.state.write() = EngineState::Idle;

        if let Ok(summary) = &result {
            if summary.trades > 0 {
                info!(pair = %self.book.pair(), "matching pass executed {} trades", summary.trades);
            }
        }
        result
    }

    async fn drain(&self, cancel: &CancellationToken) -> MatchingResult<PassSummary> {
        let mut summary = PassSummary::default();
        while !cancel.is_cancelled() {
            match self.match_once().await? {
                Some(trade) => {
                    summary.trades += 1;
                    summary.last_trade_price = Some(trade.price);
                }
                None => break,
            }
        }
        Ok(summary)
    }
}

/// Price of whichever order has the smaller `(priority, time)`; ties favour the bid.
pub fn execution_price(bid: &Order, ask: &Order) -> Decimal {
    if (bid.priority, bid.time) <= (ask.priority, ask.time) {
        bid.price
    } else {
        ask.price
    }
}

//--------------------------------------------------------------------------------------------------
//  TESTS
//--------------------------------------------------------------------------------------------------
// | Name                               | Description                                        |
// |------------------------------------|----------------------------------------------------|
// | test_full_fill_empties_both_sides  | Equal amounts at the same price                    |
// | test_partial_fill_leaves_residual  | Larger bid keeps its remainder                     |
// | test_price_from_earlier_order      | Execution price follows (priority, time)           |
// | test_no_cross_no_trade             | Spread stays open                                  |
// | test_sweep_multiple_levels         | One bid consumes several asks                      |
// | test_sink_closed                   | Nothing is committed once the outbox is gone       |
// | test_store_failure_is_retryable    | Store outage surfaces as a retryable error         |
// | test_cancelled_pass                | Cancelled token stops before the next trade        |
// | test_corrupt_top_entries_skipped   | Undecodable best bids never block valid crosses    |
// | test_commit_conflict_is_bounded    | Endless lost guards end in a retryable Conflict    |
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use crate::domain::models::types::OrderId;
    use crate::domain::services::orderbook::memory_store::MemoryStore;
    use crate::domain::services::orderbook::keys::{book_key, quarantine_key};
    use crate::domain::services::orderbook::store::{
        End, OrderedStore, ScoredMember, StoreError, StoreResult, Transaction,
    };

    /// Wraps a `MemoryStore` and fails every call while `down` is set. While
    /// `contended` is set every transaction reports a lost guard.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        down: AtomicBool,
        contended: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> StoreResult<()> {
            if self.down.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl OrderedStore for FlakyStore {
        async fn add(&self, key: &str, entries: Vec<ScoredMember>) -> StoreResult<usize> {
            self.check()?;
            self.inner.add(key, entries).await
        }
        async fn remove(&self, key: &str, member: &str) -> StoreResult<bool> {
            self.check()?;
            self.inner.remove(key, member).await
        }
        async fn peek(&self, key: &str, end: End) -> StoreResult<Option<ScoredMember>> {
            self.check()?;
            self.inner.peek(key, end).await
        }
        async fn pop(&self, key: &str, end: End) -> StoreResult<Option<ScoredMember>> {
            self.check()?;
            self.inner.pop(key, end).await
        }
        async fn range_by_score(&self, key: &str, min: Decimal, max: Decimal) -> StoreResult<Vec<ScoredMember>> {
            self.check()?;
            self.inner.range_by_score(key, min, max).await
        }
        async fn members(&self, key: &str) -> StoreResult<Vec<ScoredMember>> {
            self.check()?;
            self.inner.members(key).await
        }
        async fn score(&self, key: &str, member: &str) -> StoreResult<Option<Decimal>> {
            self.check()?;
            self.inner.score(key, member).await
        }
        async fn len(&self, key: &str) -> StoreResult<usize> {
            self.check()?;
            self.inner.len(key).await
        }
        async fn exec(&self, tx: Transaction) -> StoreResult<bool> {
            self.check()?;
            if self.contended.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.inner.exec(tx).await
        }
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.check()?;
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: String) -> StoreResult<()> {
            self.check()?;
            self.inner.set(key, value).await
        }
    }

    fn engine_over(store: Arc<dyn OrderedStore>) -> (MatchingEngine, UnboundedReceiver<Trade>) {
        let book = Arc::new(OrderBookStore::new("BTCUSD", store));
        let (tx, rx) = mpsc::unbounded_channel();
        (MatchingEngine::new(book, tx), rx)
    }

    fn engine() -> (MatchingEngine, UnboundedReceiver<Trade>) {
        engine_over(Arc::new(MemoryStore::new()))
    }

    fn order(side: Side, price: Decimal, priority: Decimal, amount: Decimal, id: &str) -> Order {
        Order::new(side, price, priority, dec!(1), amount, OrderId::new(id).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_full_fill_empties_both_sides() {
        let (engine, mut trades) = engine();
        engine
            .book()
            .insert_many(vec![
                order(Side::Bid, dec!(240), dec!(0), dec!(0.1), "A"),
                order(Side::Ask, dec!(240), dec!(0), dec!(0.1), "B"),
            ])
            .await
            .unwrap();

        let summary = engine.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.trades, 1);
        assert_eq!(summary.last_trade_price, Some(dec!(240)));

        let trade = trades.recv().await.unwrap();
        assert_eq!(trade.amount, dec!(0.1));
        assert_eq!(trade.bid_id.as_str(), "A");
        assert_eq!(trade.ask_id.as_str(), "B");
        assert_eq!(engine.book().len(Side::Bid).await.unwrap(), 0);
        assert_eq!(engine.book().len(Side::Ask).await.unwrap(), 0);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_partial_fill_leaves_residual() {
        let (engine, mut trades) = engine();
        engine
            .book()
            .insert_many(vec![
                order(Side::Bid, dec!(240), dec!(0), dec!(0.2), "A"),
                order(Side::Ask, dec!(240), dec!(0), dec!(0.1), "B"),
            ])
            .await
            .unwrap();

        engine.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(trades.recv().await.unwrap().amount, dec!(0.1));

        let bids = engine.book().entries(Side::Bid).await.unwrap();
        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].id.as_str(), "A");
        assert_eq!(bids[0].amount, dec!(0.1));
        assert_eq!(engine.book().len(Side::Ask).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_price_from_earlier_order() {
        let (engine, mut trades) = engine();
        engine
            .book()
            .insert_many(vec![
                order(Side::Bid, dec!(242), dec!(1), dec!(0.1), "A"),
                order(Side::Ask, dec!(240), dec!(0), dec!(0.1), "B"),
            ])
            .await
            .unwrap();
        engine.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(trades.recv().await.unwrap().price, dec!(240));

        let bid = order(Side::Bid, dec!(242), dec!(0), dec!(1), "A");
        let ask = order(Side::Ask, dec!(240), dec!(0), dec!(1), "B");
        assert_eq!(execution_price(&bid, &ask), dec!(242));
    }

    #[tokio::test]
    async fn test_no_cross_no_trade() {
        let (engine, mut trades) = engine();
        engine
            .book()
            .insert_many(vec![
                order(Side::Bid, dec!(239), dec!(0), dec!(1), "A"),
                order(Side::Ask, dec!(241), dec!(0), dec!(1), "B"),
            ])
            .await
            .unwrap();
        let summary = engine.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary, PassSummary::default());
        assert!(trades.try_recv().is_err());
        assert_eq!(engine.book().len(Side::Bid).await.unwrap(), 1);
        assert_eq!(engine.book().len(Side::Ask).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sweep_multiple_levels() {
        let (engine, mut trades) = engine();
        engine
            .book()
            .insert_many(vec![
                order(Side::Bid, dec!(250), dec!(0), dec!(1), "big"),
                order(Side::Ask, dec!(240), dec!(0), dec!(0.3), "a1"),
                order(Side::Ask, dec!(245), dec!(0), dec!(0.3), "a2"),
                order(Side::Ask, dec!(260), dec!(0), dec!(0.6), "a3"),
            ])
            .await
            .unwrap();

        let summary = engine.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.trades, 2);

        let first = trades.recv().await.unwrap();
        let second = trades.recv().await.unwrap();
        assert_eq!(first.ask_id.as_str(), "a1");
        assert_eq!(second.ask_id.as_str(), "a2");
        assert_eq!(engine.book().total_amount(Side::Bid).await.unwrap(), dec!(0.4));
        assert_eq!(engine.book().total_amount(Side::Ask).await.unwrap(), dec!(0.6));
    }

    #[tokio::test]
    async fn test_sink_closed() {
        let (engine, trades) = engine();
        drop(trades);
        engine
            .book()
            .insert_many(vec![
                order(Side::Bid, dec!(240), dec!(0), dec!(0.1), "A"),
                order(Side::Ask, dec!(240), dec!(0), dec!(0.1), "B"),
            ])
            .await
            .unwrap();

        let err = engine.run_pass(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, MatchingError::TradeSinkClosed);
        assert_eq!(engine.book().len(Side::Bid).await.unwrap(), 1);
        assert_eq!(engine.book().len(Side::Ask).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_retryable() {
        let store = Arc::new(FlakyStore::default());
        let (engine, _trades) = engine_over(store.clone());
        engine
            .book()
            .insert(order(Side::Bid, dec!(240), dec!(0), dec!(0.1), "A"))
            .await
            .unwrap();

        store.down.store(true, Ordering::SeqCst);
        let err = engine.run_pass(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MatchingError::Orderbook(OrderbookError::StoreUnavailable(_))));
        assert!(err.is_retryable());
        assert_eq!(engine.state(), EngineState::Idle);

        store.down.store(false, Ordering::SeqCst);
        assert_eq!(engine.book().len(Side::Bid).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_pass() {
        let (engine, _trades) = engine();
        engine
            .book()
            .insert_many(vec![
                order(Side::Bid, dec!(240), dec!(0), dec!(0.1), "A"),
                order(Side::Ask, dec!(240), dec!(0), dec!(0.1), "B"),
            ])
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = engine.run_pass(&cancel).await.unwrap();
        assert_eq!(summary.trades, 0);
        assert_eq!(engine.book().len(Side::Ask).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_top_entries_skipped() {
        let store = Arc::new(MemoryStore::new());
        let bids = book_key("BTCUSD", Side::Bid);
        store
            .add(
                &bids,
                vec![
                    // Short-form fields, as written by older producers.
                    ScoredMember::new(dec!(0), "240|1|0.1|A"),
                    // Amount finer than the fixed-width encoding allows.
                    ScoredMember::new(
                        dec!(5),
                        "00000000000000240.000000000000|00000000000000001.000000000000|0.1000000000001|X",
                    ),
                ],
            )
            .await
            .unwrap();
        let (engine, mut trades) = engine_over(store.clone());
        engine
            .book()
            .insert_many(vec![
                order(Side::Bid, dec!(240), dec!(0), dec!(0.1), "C"),
                order(Side::Ask, dec!(240), dec!(0), dec!(0.1), "B"),
            ])
            .await
            .unwrap();

        let summary = tokio::time::timeout(std::time::Duration::from_secs(2), engine.run_pass(&CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.trades, 1);

        let trade = trades.recv().await.unwrap();
        assert_eq!(trade.bid_id.as_str(), "C");
        assert_eq!(trade.ask_id.as_str(), "B");
        assert_eq!(engine.book().len(Side::Bid).await.unwrap(), 0);
        assert_eq!(engine.book().len(Side::Ask).await.unwrap(), 0);
        assert_eq!(store.len(&quarantine_key("BTCUSD", Side::Bid)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_commit_conflict_is_bounded() {
        let store = Arc::new(FlakyStore::default());
        let (engine, mut trades) = engine_over(store.clone());
        engine
            .book()
            .insert_many(vec![
                order(Side::Bid, dec!(240), dec!(0), dec!(0.1), "A"),
                order(Side::Ask, dec!(240), dec!(0), dec!(0.1), "B"),
            ])
            .await
            .unwrap();

        store.contended.store(true, Ordering::SeqCst);
        let err = engine.run_pass(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MatchingError::Orderbook(OrderbookError::Conflict(ref id)) if id.as_str() == "A"));
        assert!(err.is_retryable());
        assert!(trades.try_recv().is_err());

        store.contended.store(false, Ordering::SeqCst);
        assert_eq!(engine.run_pass(&CancellationToken::new()).await.unwrap().trades, 1);
    }
}
