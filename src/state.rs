//! Replay-visible tables and the speculative overlay they are written through.
//!
//! Committed rows live in an `Arc`-shared map. Speculative writes go into an
//! overlay of `Option<V>` (None marks a delete) and are either folded into the
//! committed map at commit or dropped wholesale on rebuild.

use crate::order::{GoodTil, OrderId};
use crate::types::BlockHeight;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Copy-on-write view over a committed map.
#[derive(Debug, Clone)]
pub struct Overlay<K, V> {
    base: Arc<BTreeMap<K, V>>,
    writes: BTreeMap<K, Option<V>>,
}

impl<K: Ord + Clone, V: Clone> Default for Overlay<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V: Clone> Overlay<K, V> {
    pub fn new() -> Self {
        Self {
            base: Arc::new(BTreeMap::new()),
            writes: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        match self.writes.get(key) {
            Some(write) => write.as_ref(),
            None => self.base.get(key),
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.writes.insert(key, Some(value));
    }

    pub fn remove(&mut self, key: &K) {
        if self.contains_key(key) {
            self.writes.insert(key.clone(), None);
        }
    }

    pub fn is_dirty(&self) -> bool {
        !self.writes.is_empty()
    }

    /// Drop every speculative write.
    pub fn discard(&mut self) {
        self.writes.clear();
    }

    /// Fold speculative writes into the committed map. Clones the committed
    /// map only if a snapshot still shares it.
    pub fn commit(&mut self) {
        if self.writes.is_empty() {
            return;
        }
        let base = Arc::make_mut(&mut self.base);
        for (key, write) in std::mem::take(&mut self.writes) {
            match write {
                Some(value) => {
                    base.insert(key, value);
                }
                None => {
                    base.remove(&key);
                }
            }
        }
    }

    pub fn committed(&self) -> &BTreeMap<K, V> {
        &self.base
    }

    /// Merged entries in key order.
    pub fn entries(&self) -> Vec<(&K, &V)> {
        let mut merged: BTreeMap<&K, &V> = self
            .base
            .iter()
            .filter(|(k, _)| !self.writes.contains_key(*k))
            .collect();
        for (key, write) in &self.writes {
            if let Some(value) = write {
                merged.insert(key, value);
            }
        }
        merged.into_iter().collect()
    }

    pub fn keys_where(&self, mut predicate: impl FnMut(&K, &V) -> bool) -> Vec<K> {
        self.entries()
            .into_iter()
            .filter(|(k, v)| predicate(k, v))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cumulative fill of one order id. Kept until the id can no longer be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillRecord {
    pub filled_quantums: u64,
    pub prunable_after: GoodTil,
}

pub type FillAmounts = Overlay<OrderId, FillRecord>;

/// Latest accepted cancel deadline per order id.
pub type CancelRecords = Overlay<OrderId, GoodTil>;

/// Chain-wide flag blocking withdrawals and transfers after unresolved negative collateral.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalsGate {
    gated_at: Option<BlockHeight>,
}

impl WithdrawalsGate {
    /// Records the first height that gated withdrawals. Later triggers keep it.
    pub fn gate(&mut self, height: BlockHeight) {
        if self.gated_at.is_none() {
            self.gated_at = Some(height);
        }
    }

    pub fn gated_at(&self) -> Option<BlockHeight> {
        self.gated_at
    }

    pub fn is_gated(&self) -> bool {
        self.gated_at.is_some()
    }

    // external recovery only
    pub fn clear(&mut self) {
        self.gated_at = None;
    }
}
