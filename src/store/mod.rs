//! Knowledge store module
//!
//! The transport consumes a store through the `KnowledgeStore` trait. An
//! in-memory implementation, `KnowledgeBase`, is provided for agents that
//! do not bring their own.

mod resolver;

pub use resolver::*;

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Notify;

use crate::protocol::{Update, Value};

/// A stored value with the stamps that decide its precedence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub value: Value,
    /// Logical clock of the write that produced this value
    pub clock: u64,
    /// Writer's precedence
    pub quality: u32,
}

/// A local update waiting to be sent
#[derive(Debug, Clone, PartialEq)]
pub struct LocalUpdate {
    pub update: Update,
    pub clock: u64,
    pub quality: u32,
}

/// Local updates drained for one outgoing batch, all carrying the batch stamps
#[derive(Debug, Clone, PartialEq)]
pub struct LocalBatch {
    pub updates: Vec<Update>,
    pub clock: u64,
    pub quality: u32,
}

/// Exclusive access to the entries of a store, held for one batch
pub trait EntryAccess {
    fn get(&self, key: &str) -> Option<&Record>;
    fn put(&mut self, key: &str, record: Record);
}

/// The store contract consumed by the transport.
///
/// Implementations must be safe for concurrent use: the receive task and
/// the control loop call into the store from different threads.
pub trait KnowledgeStore: Send + Sync + 'static {
    /// Run `f` while holding the store's lock
    fn transact<R>(&self, f: impl FnOnce(&mut dyn EntryAccess) -> R) -> R;

    /// Take every local update written since the last drain
    fn drain_local_updates(&self) -> Vec<LocalUpdate>;

    /// Current logical clock
    fn clock(&self) -> u64;

    /// Drain local updates as one batch stamped with the current clock and
    /// the highest drained quality.
    ///
    /// The drained records are re-stamped to match, so the sender holds the
    /// same stamps as every receiver that accepts the batch. This version
    /// re-stamps under a second lock and skips records rewritten in between;
    /// stores that can drain and re-stamp under one lock should override it.
    fn drain_batch(&self) -> Option<LocalBatch> {
        let drained = self.drain_local_updates();
        let quality = drained.iter().map(|local| local.quality).max()?;
        let clock = self.clock();

        self.transact(|entries| {
            for local in &drained {
                let unchanged = entries.get(&local.update.key).map_or(false, |r| {
                    r.clock == local.clock
                        && r.quality == local.quality
                        && r.value == local.update.value
                });
                if unchanged {
                    entries.put(
                        &local.update.key,
                        Record {
                            value: local.update.value.clone(),
                            clock,
                            quality,
                        },
                    );
                }
            }
        });

        Some(LocalBatch {
            updates: drained.into_iter().map(|local| local.update).collect(),
            clock,
            quality,
        })
    }

    /// Signal that remote updates were applied
    fn set_changed(&self) {}
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Record>,
    clock: u64,
    /// Quality stamped on local writes, per key
    qualities: BTreeMap<String, u32>,
    pending: BTreeSet<String>,
}

impl EntryAccess for State {
    fn get(&self, key: &str) -> Option<&Record> {
        self.entries.get(key)
    }

    fn put(&mut self, key: &str, record: Record) {
        // Local writes after this must be ordered after the remote one
        self.clock = self.clock.max(record.clock);
        self.entries.insert(key.to_string(), record);
    }
}

/// In-memory knowledge base
#[derive(Debug, Default)]
pub struct KnowledgeBase {
    state: Mutex<State>,
    changed: Notify,
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a value locally. The write advances the clock and is queued
    /// for the next send.
    pub fn set(&self, key: &str, value: Value) -> u64 {
        let mut state = self.state.lock();
        state.clock += 1;
        let clock = state.clock;
        let quality = state.qualities.get(key).copied().unwrap_or(0);
        state.entries.insert(
            key.to_string(),
            Record {
                value,
                clock,
                quality,
            },
        );
        state.pending.insert(key.to_string());
        clock
    }

    /// Set the quality stamped on subsequent local writes of `key`
    pub fn set_quality(&self, key: &str, quality: u32) {
        self.state.lock().qualities.insert(key.to_string(), quality);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().entries.get(key).map(|r| r.value.clone())
    }

    pub fn record(&self, key: &str) -> Option<Record> {
        self.state.lock().entries.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Copy of every entry, ordered by key
    pub fn snapshot(&self) -> BTreeMap<String, Record> {
        self.state.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until remote updates are applied
    pub async fn changed(&self) {
        self.changed.notified().await
    }
}

impl KnowledgeStore for KnowledgeBase {
    fn transact<R>(&self, f: impl FnOnce(&mut dyn EntryAccess) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut *state)
    }

    fn drain_local_updates(&self) -> Vec<LocalUpdate> {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        pending
            .into_iter()
            .filter_map(|key| {
                let record = state.entries.get(&key)?;
                Some(LocalUpdate {
                    update: Update::new(key.clone(), record.value.clone()),
                    clock: record.clock,
                    quality: record.quality,
                })
            })
            .collect()
    }

    fn clock(&self) -> u64 {
        self.state.lock().clock
    }

    fn drain_batch(&self) -> Option<LocalBatch> {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        let clock = state.clock;
        let quality = pending
            .iter()
            .filter_map(|key| state.entries.get(key))
            .map(|record| record.quality)
            .max()?;

        let mut updates = Vec::with_capacity(pending.len());
        for key in pending {
            if let Some(record) = state.entries.get_mut(&key) {
                record.clock = clock;
                record.quality = quality;
                updates.push(Update::new(key, record.value.clone()));
            }
        }

        Some(LocalBatch {
            updates,
            clock,
            quality,
        })
    }

    fn set_changed(&self) {
        self.changed.notify_waiters();
    }
}
