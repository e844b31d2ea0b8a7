//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// In-process implementation of `OrderedStore`. Each key maps to a sorted set backed by a
// BTreeSet (ordering) plus a HashMap (member -> score lookup), mirroring how sorted-set stores
// index their members. All state sits behind one lock so every call and every transaction is
// atomic with respect to every other call.
//
// | Component     | Description                                                       |
// |---------------|-------------------------------------------------------------------|
// | SortedSet     | Ordered unique members with O(log n) insert/remove/peek            |
// | MemoryStore   | Thread-safe store of sorted sets and string slots                 |
//--------------------------------------------------------------------------------------------------

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::debug;

use super::store::{End, OrderedStore, ScoredMember, StoreOp, StoreResult, Transaction};

#[derive(Debug, Default)]
struct SortedSet {
    ordered: BTreeSet<ScoredMember>,
    scores: HashMap<String, Decimal>,
}

impl SortedSet {
    /// Inserts or re-scores `entry`. Returns true if the member was new.
    fn insert(&mut self, entry: ScoredMember) -> bool {
        let is_new = match self.scores.insert(entry.member.clone(), entry.score) {
            Some(previous) => {
                self.ordered
                    .remove(&ScoredMember::new(previous, entry.member.clone()));
                false
            }
            None => true,
        };
        self.ordered.insert(entry);
        is_new
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&ScoredMember::new(score, member));
                true
            }
            None => false,
        }
    }

    fn contains(&self, entry: &ScoredMember) -> bool {
        self.scores
            .get(&entry.member)
            .is_some_and(|score| *score == entry.score)
    }

    fn peek(&self, end: End) -> Option<&ScoredMember> {
        match end {
            End::Min => self.ordered.first(),
            End::Max => self.ordered.last(),
        }
    }

    fn pop(&mut self, end: End) -> Option<ScoredMember> {
        let entry = match end {
            End::Min => self.ordered.pop_first(),
            End::Max => self.ordered.pop_last(),
        }?;
        self.scores.remove(&entry.member);
        Some(entry)
    }

    fn range(&self, min: Decimal, max: Decimal) -> Vec<ScoredMember> {
        self.ordered
            .range(ScoredMember::new(min, String::new())..)
            .take_while(|entry| entry.score <= max)
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.ordered.len()
    }
}

#[derive(Debug, Default)]
struct Inner {
    sets: HashMap<String, SortedSet>,
    values: HashMap<String, String>,
}

impl Inner {
    fn apply(&mut self, op: StoreOp) {
        match op {
            StoreOp::Add { key, entry } => {
                self.sets.entry(key).or_default().insert(entry);
            }
            StoreOp::Remove { key, member } => {
                if let Some(set) = self.sets.get_mut(&key) {
                    set.remove(&member);
                }
            }
            StoreOp::Set { key, value } => {
                self.values.insert(key, value);
            }
        }
    }
}

/// Ordered store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderedStore for MemoryStore {
    async fn add(&self, key: &str, entries: Vec<ScoredMember>) -> StoreResult<usize> {
        let mut inner = self.inner.write();
        let set = inner.sets.entry(key.to_string()).or_default();
        let added = entries
            .into_iter()
            .filter(|entry| set.insert(entry.clone()))
            .count();
        debug!("added {} new members to {}", added, key);
        Ok(added)
    }

    async fn remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut inner = self.inner.write();
        Ok(inner
            .sets
            .get_mut(key)
            .is_some_and(|set| set.remove(member)))
    }

    async fn peek(&self, key: &str, end: End) -> StoreResult<Option<ScoredMember>> {
        let inner = self.inner.read();
        Ok(inner.sets.get(key).and_then(|set| set.peek(end)).cloned())
    }

    async fn pop(&self, key: &str, end: End) -> StoreResult<Option<ScoredMember>> {
        let mut inner = self.inner.write();
        Ok(inner.sets.get_mut(key).and_then(|set| set.pop(end)))
    }

    async fn range_by_score(&self, key: &str, min: Decimal, max: Decimal) -> StoreResult<Vec<ScoredMember>> {
        let inner = self.inner.read();
        Ok(inner
            .sets
            .get(key)
            .map(|set| set.range(min, max))
            .unwrap_or_default())
    }

    async fn members(&self, key: &str) -> StoreResult<Vec<ScoredMember>> {
        let inner = self.inner.read();
        Ok(inner
            .sets
            .get(key)
            .map(|set| set.ordered.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn score(&self, key: &str, member: &str) -> StoreResult<Option<Decimal>> {
        let inner = self.inner.read();
        Ok(inner.sets.get(key).and_then(|set| set.scores.get(member).copied()))
    }

    async fn len(&self, key: &str) -> StoreResult<usize> {
        let inner = self.inner.read();
        Ok(inner.sets.get(key).map(SortedSet::len).unwrap_or(0))
    }

    async fn exec(&self, tx: Transaction) -> StoreResult<bool> {
        let mut inner = self.inner.write();
        let guards_hold = tx.guards.iter().all(|(key, entry)| {
            inner
                .sets
                .get(key)
                .is_some_and(|set| set.contains(entry))
        });
        if !guards_hold {
            debug!("transaction aborted, a guarded entry is no longer resident");
            return Ok(false);
        }
        for op in tx.ops {
            inner.apply(op);
        }
        Ok(true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.inner.read().values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        self.inner.write().values.insert(key.to_string(), value);
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
//  TESTS
//--------------------------------------------------------------------------------------------------
