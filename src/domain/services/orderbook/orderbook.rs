//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module implements the order book for a single trading pair on top of an `OrderedStore`.
// Each side lives in its own sorted collection; entries are encoded by `priority_key` so the
// store's native (score, member) order is the book's priority order.
//
// | Component        | Description                                                         |
// |------------------|---------------------------------------------------------------------|
// | OrderBookStore   | Side-scoped insert / peek / pop / remove / update over the store    |
// | UpdateOutcome    | What an `update` call ended up doing                                |
//
//--------------------------------------------------------------------------------------------------
// FUNCTIONS
//--------------------------------------------------------------------------------------------------
// | Name              | Description                                        | Return Type              |
// |-------------------|----------------------------------------------------|--------------------------|
// | peek_best         | Best entry of a side, left in place                | Option<Order>            |
// | pop_best          | Best entry of a side, removed under a guard        | Option<Order>            |
// | insert            | Adds one order                                     | ()                       |
// | insert_many       | Adds a batch, one store write per side             | usize                    |
// | admit             | Adds an order unless its id was ever admitted      | bool                     |
// | remove            | Removes the exact entry of an order (idempotent)   | bool                     |
// | update            | Atomically replaces the entry with the same id     | UpdateOutcome            |
// | commit_match      | Applies both sides of one fill in one transaction  | bool                     |
// | get_ticker        | Last published ticker snapshot                     | TickerSnapshot           |
// | set_ticker        | Persists a ticker snapshot                         | ()                       |
// | snapshot_ticker   | Recomputes best bid / ask from the book            | TickerSnapshot           |
//--------------------------------------------------------------------------------------------------

use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use super::keys::{admitted_key, book_key, quarantine_key, ticker_key};
use super::priority_key::{self, KeyError};
use super::store::{End, OrderedStore, ScoredMember, Transaction};
use super::OrderbookError;
use crate::domain::models::types::{Order, Side, TickerSnapshot};

pub type OrderbookResult<T> = Result<T, OrderbookError>;

/// How many times `update` rescans after losing a race before giving up.
const MAX_UPDATE_ATTEMPTS: usize = 8;

/// Result of [`OrderBookStore::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// An entry with the same id and price was replaced.
    Replaced,
    /// No entry matched and the order was inserted.
    Inserted,
    /// No entry matched and `upsert` was false.
    Skipped,
}

/// The order book of one trading pair.
///
/// Every mutation goes through the store's atomic operations; read-modify-write
/// sequences (`update`, `commit_match`) are guarded transactions, so a concurrent
/// writer makes them retry instead of leaving a stale and a fresh entry behind.
pub struct OrderBookStore {
    pair: String,
    store: Arc<dyn OrderedStore>,
    bid_key: String,
    ask_key: String,
    admitted_key: String,
    ticker_key: String,
    /// Serializes this process's read-modify-write sequences.
    write_lock: Mutex<()>,
}

impl OrderBookStore {
    /// Opens the book of `pair` in `store`.
    pub fn new(pair: impl Into<String>, store: Arc<dyn OrderedStore>) -> Self {
        let pair = pair.into();
        Self {
            bid_key: book_key(&pair, Side::Bid),
            ask_key: book_key(&pair, Side::Ask),
            admitted_key: admitted_key(&pair),
            ticker_key: ticker_key(&pair),
            pair,
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub fn pair(&self) -> &str {
        &self.pair
    }

    fn side_key(&self, side: Side) -> &str {
        match side {
            Side::Bid => &self.bid_key,
            Side::Ask => &self.ask_key,
        }
    }

    /// Bids are served from the top of the shared ordering, asks from the bottom.
    fn best_end(side: Side) -> End {
        match side {
            Side::Bid => End::Max,
            Side::Ask => End::Min,
        }
    }

    /// Returns the best order of `side` without removing it.
    ///
    /// Entries that fail to decode are moved to the side's quarantine collection and
    /// skipped, so a corrupt entry never blocks the rest of the book.
    pub async fn peek_best(&self, side: Side) -> OrderbookResult<Option<Order>> {
        let key = self.side_key(side);
        loop {
            let Some(entry) = self.store.peek(key, Self::best_end(side)).await? else {
                return Ok(None);
            };
            match priority_key::decode(side, &entry) {
                Ok(order) => return Ok(Some(order)),
                Err(err) => self.quarantine(side, &entry, &err).await?,
            }
        }
    }

    /// Removes and returns the best order of `side`.
    ///
    /// The removal is guarded on the entry that was read, so two callers can never both
    /// obtain the same order. Malformed entries are quarantined exactly as in `peek_best`.
    pub async fn pop_best(&self, side: Side) -> OrderbookResult<Option<Order>> {
        let key = self.side_key(side);
        loop {
            let Some(entry) = self.store.peek(key, Self::best_end(side)).await? else {
                return Ok(None);
            };
            match priority_key::decode(side, &entry) {
                Ok(order) => {
                    let tx = Transaction::new().guard(key, &entry).remove(key, &entry.member);
                    if self.store.exec(tx).await? {
                        return Ok(Some(order));
                    }
                    debug!(pair = %self.pair, %side, "best entry taken concurrently, retrying pop");
                }
                Err(err) => self.quarantine(side, &entry, &err).await?,
            }
        }
    }

    async fn quarantine(&self, side: Side, entry: &ScoredMember, err: &KeyError) -> OrderbookResult<()> {
        error!(pair = %self.pair, %side, "quarantining malformed entry {:?}: {}", entry.member, err);
        let key = self.side_key(side);
        let tx = Transaction::new()
            .guard(key, entry)
            .remove(key, &entry.member)
            .add(&quarantine_key(&self.pair, side), entry.clone());
        if !self.store.exec(tx).await? {
            debug!("malformed entry {:?} already gone", entry.member);
        }
        Ok(())
    }

    /// Inserts a single order.
    pub async fn insert(&self, order: Order) -> OrderbookResult<()> {
        self.insert_many(vec![order]).await.map(|_| ())
    }

    /// Inserts a batch of orders with at most one store write per side.
    ///
    /// # Returns
    /// The number of entries that were not already resident.
    pub async fn insert_many(&self, orders: Vec<Order>) -> OrderbookResult<usize> {
        let mut bids = Vec::new();
        let mut asks = Vec::new();
        for order in &orders {
            let entry = encode(order)?;
            match order.side {
                Side::Bid => bids.push(entry),
                Side::Ask => asks.push(entry),
            }
        }

        let mut added = 0;
        if !bids.is_empty() {
            added += self.store.add(&self.bid_key, bids).await?;
        }
        if !asks.is_empty() {
            added += self.store.add(&self.ask_key, asks).await?;
        }
        debug!(pair = %self.pair, "inserted {} of {} orders", added, orders.len());
        Ok(added)
    }

    /// Inserts an externally funded order exactly once per id.
    ///
    /// The id is recorded in the pair's admitted set in the same transaction as the book
    /// entry. An id seen before, whether still resident or already filled, is refused, so
    /// a redelivered funding message never adds liquidity twice.
    ///
    /// # Returns
    /// `true` if the order was inserted, `false` if its id was already admitted.
    pub async fn admit(&self, order: Order) -> OrderbookResult<bool> {
        let entry = encode(&order)?;
        let _guard = self.write_lock.lock().await;

        if self
            .store
            .score(&self.admitted_key, order.id.as_str())
            .await?
            .is_some()
        {
            warn!(pair = %self.pair, id = %order.id, "order id already admitted, ignoring");
            return Ok(false);
        }

        let tx = Transaction::new()
            .add(&self.admitted_key, ScoredMember::new(order.time, order.id.as_str()))
            .add(self.side_key(order.side), entry);
        Ok(self.store.exec(tx).await?)
    }

    /// Removes the entry exactly matching `order` from `side`.
    ///
    /// Removing an order that is not resident is a no-op.
    pub async fn remove(&self, side: Side, order: &Order) -> OrderbookResult<bool> {
        let entry = match priority_key::encode(order) {
            Ok(entry) => entry,
            // Nothing unencodable can be resident.
            Err(_) => return Ok(false),
        };
        Ok(self.store.remove(self.side_key(side), &entry.member).await?)
    }

    /// Replaces the resident entry sharing `order`'s id and price with `order`.
    ///
    /// The replacement is one guarded transaction: readers see either the old entry
    /// or the new one, never both and never neither. When no entry matches, `order`
    /// is inserted if `upsert` is set.
    pub async fn update(&self, order: &Order, upsert: bool) -> OrderbookResult<UpdateOutcome> {
        let key = self.side_key(order.side);
        let new_entry = encode(order)?;
        let _guard = self.write_lock.lock().await;

        for attempt in 0..MAX_UPDATE_ATTEMPTS {
            let bucket = self
                .store
                .range_by_score(key, order.priority, order.priority)
                .await?;
            let existing = bucket.into_iter().find(|entry| {
                priority_key::decode(order.side, entry)
                    .is_ok_and(|resident| resident.id == order.id && resident.price == order.price)
            });

            let tx = match existing {
                Some(old) if old == new_entry => return Ok(UpdateOutcome::Replaced),
                Some(old) => Transaction::new()
                    .guard(key, &old)
                    .remove(key, &old.member)
                    .add(key, new_entry.clone()),
                None if upsert => {
                    self.store.add(key, vec![new_entry]).await?;
                    return Ok(UpdateOutcome::Inserted);
                }
                None => return Ok(UpdateOutcome::Skipped),
            };

            if self.store.exec(tx).await? {
                return Ok(UpdateOutcome::Replaced);
            }
            warn!(pair = %self.pair, id = %order.id, attempt, "entry changed during update, rescanning");
        }

        Err(OrderbookError::Conflict(order.id.clone()))
    }

    /// Applies one fill of `amount` to `bid` and `ask` as a single transaction.
    ///
    /// A side whose remaining amount reaches zero is removed; otherwise its entry is
    /// replaced by the residual order. Returns `false`, with nothing written, if either
    /// pre-fill entry is no longer resident.
    pub async fn commit_match(&self, bid: &Order, ask: &Order, amount: Decimal) -> OrderbookResult<bool> {
        let mut tx = Transaction::new();
        for order in [bid, ask] {
            let key = self.side_key(order.side);
            let current = encode(order)?;
            tx = tx.guard(key, &current).remove(key, &current.member);

            let remaining = order.amount - amount;
            if remaining > Decimal::ZERO {
                let residual = order
                    .with_amount(remaining)
                    .map_err(|err| OrderbookError::InvalidOrder(err.to_string()))?;
                tx = tx.add(key, encode(&residual)?);
            }
        }

        let _guard = self.write_lock.lock().await;
        Ok(self.store.exec(tx).await?)
    }

    /// Returns the last published ticker snapshot.
    ///
    /// # Errors
    /// `OrderbookError::TickerUnavailable` if no snapshot was ever stored.
    pub async fn get_ticker(&self) -> OrderbookResult<TickerSnapshot> {
        let raw = self
            .store
            .get(&self.ticker_key)
            .await?
            .ok_or_else(|| OrderbookError::TickerUnavailable(self.pair.clone()))?;
        serde_json::from_str(&raw).map_err(|err| OrderbookError::Serialization(err.to_string()))
    }

    /// Persists `snapshot` as the pair's current ticker.
    pub async fn set_ticker(&self, snapshot: &TickerSnapshot) -> OrderbookResult<()> {
        let raw = serde_json::to_string(snapshot)
            .map_err(|err| OrderbookError::Serialization(err.to_string()))?;
        self.store.set(&self.ticker_key, raw).await?;
        Ok(())
    }

    /// Recomputes the ticker from the current top of book.
    pub async fn snapshot_ticker(&self, last_trade_price: Option<Decimal>) -> OrderbookResult<TickerSnapshot> {
        let best_bid = self.peek_best(Side::Bid).await?.map(|order| order.price);
        let best_ask = self.peek_best(Side::Ask).await?.map(|order| order.price);
        Ok(TickerSnapshot {
            best_bid,
            best_ask,
            last_trade_price,
        })
    }

    /// Number of entries resident on `side`.
    pub async fn len(&self, side: Side) -> OrderbookResult<usize> {
        Ok(self.store.len(self.side_key(side)).await?)
    }

    /// Decodable entries of `side` in ascending store order.
    pub async fn entries(&self, side: Side) -> OrderbookResult<Vec<Order>> {
        let entries = self.store.members(self.side_key(side)).await?;
        Ok(entries
            .iter()
            .filter_map(|entry| priority_key::decode(side, entry).ok())
            .collect())
    }

    /// Sum of the amounts resident on `side`.
    pub async fn total_amount(&self, side: Side) -> OrderbookResult<Decimal> {
        Ok(self
            .entries(side)
            .await?
            .iter()
            .map(|order| order.amount)
            .sum())
    }
}

fn encode(order: &Order) -> OrderbookResult<ScoredMember> {
    priority_key::encode(order).map_err(|err| OrderbookError::InvalidOrder(err.to_string()))
}

//--------------------------------------------------------------------------------------------------
//  TESTS
//--------------------------------------------------------------------------------------------------
// | Name                                | Description                                          |
// |-------------------------------------|------------------------------------------------------|
// | test_empty_book                     | peek/pop on empty sides                              |
// | test_best_retrieval_direction       | Bids served from the max end, asks from the min end  |
// | test_ask_extraction_is_non_decreasing | Priority, time, amount, id tie-breaks              |
// | test_remove_is_idempotent           | Removing twice never errors                          |
// | test_update_replaces_in_place       | Residual replaces entry with same id                 |
// | test_update_upsert_flag             | Insert vs skip when nothing matches                  |
// | test_concurrent_updates             | Never two entries for one id                         |
// | test_admit_once_per_id              | Second admission of an id is refused, even after fill|
// | test_malformed_entry_is_quarantined | Corrupt entry skipped and moved aside                |
// | test_pop_quarantines_malformed      | pop_best moves corrupt entries aside, pops the next  |
// | test_pop_never_drops_on_failure     | Failed quarantine leaves the entry resident          |
// | test_ticker_roundtrip               | TickerUnavailable, then set/get                      |
// | test_commit_match_guards            | Stale pre-fill entries abort the transaction         |
//--------------------------------------------------------------------------------------------------
