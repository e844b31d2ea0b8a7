//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// The ordered key-value capability the order book is built on. It is modelled after a
// sorted-set store: every key names a collection of unique members, each carrying a numeric
// score, kept ordered by (score, member). A plain string slot per key is available as well.
//
// | Component     | Description                                                       |
// |---------------|-------------------------------------------------------------------|
// | ScoredMember  | One collection entry, ordered by score then member string         |
// | End           | Which end of a collection to read from                            |
// | StoreOp       | A single mutation inside a transaction                            |
// | Transaction   | Guarded batch of mutations applied all-or-nothing                 |
// | OrderedStore  | Async trait every backing store implements                        |
// | StoreError    | Failures reported by a backing store                              |
//--------------------------------------------------------------------------------------------------

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors reported by a backing store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or timed out. Always retryable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A collection entry. Field order matters: the derived `Ord` compares `score` first, then
/// `member` lexicographically, which is exactly the collection order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScoredMember {
    pub score: Decimal,
    pub member: String,
}

impl ScoredMember {
    pub fn new(score: Decimal, member: impl Into<String>) -> Self {
        Self {
            score,
            member: member.into(),
        }
    }
}

/// End of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    /// Lowest (score, member).
    Min,
    /// Highest (score, member).
    Max,
}

/// A mutation applied as part of a [`Transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Insert `entry` into `key`, replacing the score if the member already exists.
    Add { key: String, entry: ScoredMember },
    /// Remove `member` from `key`. Removing an absent member is a no-op.
    Remove { key: String, member: String },
    /// Overwrite the string slot `key`.
    Set { key: String, value: String },
}

/// An all-or-nothing batch of mutations.
///
/// Every guard must be resident (same member with the same score) when the transaction is
/// applied, otherwise nothing is written and [`OrderedStore::exec`] returns `Ok(false)`.
/// No reader can observe the store between two operations of one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    pub guards: Vec<(String, ScoredMember)>,
    pub ops: Vec<StoreOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `entry` to be resident in `key` when the transaction runs.
    pub fn guard(mut self, key: &str, entry: &ScoredMember) -> Self {
        self.guards.push((key.to_string(), entry.clone()));
        self
    }

    pub fn add(mut self, key: &str, entry: ScoredMember) -> Self {
        self.ops.push(StoreOp::Add {
            key: key.to_string(),
            entry,
        });
        self
    }

    pub fn remove(mut self, key: &str, member: &str) -> Self {
        self.ops.push(StoreOp::Remove {
            key: key.to_string(),
            member: member.to_string(),
        });
        self
    }

    pub fn set(mut self, key: &str, value: String) -> Self {
        self.ops.push(StoreOp::Set {
            key: key.to_string(),
            value,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Ordered associative store the order book lives in.
///
/// Implementations must be safe to share between tasks; every method is atomic on its own.
#[async_trait]
pub trait OrderedStore: Send + Sync {
    /// Inserts entries into `key` in one write. Returns how many members were new.
    async fn add(&self, key: &str, entries: Vec<ScoredMember>) -> StoreResult<usize>;

    /// Removes `member` from `key`. Returns whether it was present.
    async fn remove(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Reads the entry at `end` of `key` without removing it.
    async fn peek(&self, key: &str, end: End) -> StoreResult<Option<ScoredMember>>;

    /// Removes and returns the entry at `end` of `key` in one atomic step.
    async fn pop(&self, key: &str, end: End) -> StoreResult<Option<ScoredMember>>;

    /// All entries of `key` with `min <= score <= max`, ascending.
    async fn range_by_score(&self, key: &str, min: Decimal, max: Decimal) -> StoreResult<Vec<ScoredMember>>;

    /// All entries of `key`, ascending.
    async fn members(&self, key: &str) -> StoreResult<Vec<ScoredMember>>;

    /// Score of `member` in `key`, if resident.
    async fn score(&self, key: &str, member: &str) -> StoreResult<Option<Decimal>>;

    /// Number of entries in `key`.
    async fn len(&self, key: &str) -> StoreResult<usize>;

    /// Applies a guarded transaction. `Ok(false)` means a guard failed and nothing was written.
    async fn exec(&self, tx: Transaction) -> StoreResult<bool>;

    /// Reads the string slot `key`.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Writes the string slot `key`.
    async fn set(&self, key: &str, value: String) -> StoreResult<()>;
}
