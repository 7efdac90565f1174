use model::{Hyperrectangle, LocalTableName, Tuple};
use rand::seq::IteratorRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::trace;

/// Invoked for every tuple written to a store, on the writer's task.
/// Implementations must return quickly and never block.
pub type InsertCallback = Arc<dyn Fn(&LocalTableName, &Tuple) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

pub struct TupleStoreManager {
    name: LocalTableName,
    /// Newest version last.
    versions: RwLock<HashMap<String, Vec<Tuple>>>,
    callbacks: RwLock<Vec<(CallbackId, InsertCallback)>>,
    next_callback: AtomicU64,
}

impl TupleStoreManager {
    pub fn new(name: LocalTableName) -> Self {
        Self {
            name,
            versions: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
            next_callback: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &LocalTableName {
        &self.name
    }

    pub fn insert(&self, tuple: Tuple) {
        {
            let mut versions = self
                .versions
                .write()
                .expect("No one should panic while holding this lock");
            let entry = versions.entry(tuple.key.clone()).or_default();
            let position = entry.partition_point(|t| t.version <= tuple.version);
            entry.insert(position, tuple.clone());
        }

        let callbacks = self
            .callbacks
            .read()
            .expect("No one should panic while holding this lock")
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect::<Vec<_>>();
        trace!(table = %self.name, key = %tuple.key, callbacks = callbacks.len(), "Inserted tuple");
        for callback in callbacks {
            callback(&self.name, &tuple);
        }
    }

    /// All stored versions of `key`, oldest first.
    pub fn get(&self, key: &str) -> Vec<Tuple> {
        self.versions
            .read()
            .expect("No one should panic while holding this lock")
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn newest(&self, key: &str) -> Option<Tuple> {
        self.versions
            .read()
            .expect("No one should panic while holding this lock")
            .get(key)
            .and_then(|v| v.last().cloned())
    }

    /// Newest live version of every key whose bounding box intersects `range`.
    pub fn range_query(&self, range: &Hyperrectangle) -> Vec<Tuple> {
        self.versions
            .read()
            .expect("No one should panic while holding this lock")
            .values()
            .filter_map(|v| v.last())
            .filter(|t| !t.is_deleted() && t.bbox.intersects(range))
            .cloned()
            .collect()
    }

    pub fn sample(&self) -> Option<Tuple> {
        self.versions
            .read()
            .expect("No one should panic while holding this lock")
            .values()
            .filter_map(|v| v.last())
            .filter(|t| !t.is_deleted())
            .choose(&mut rand::rng())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.versions
            .read()
            .expect("No one should panic while holding this lock")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn register_insert_callback(&self, callback: InsertCallback) -> CallbackId {
        let id = CallbackId(self.next_callback.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .write()
            .expect("No one should panic while holding this lock")
            .push((id, callback));
        id
    }

    pub fn remove_insert_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self
            .callbacks
            .write()
            .expect("No one should panic while holding this lock");
        let before = callbacks.len();
        callbacks.retain(|(registered, _)| *registered != id);
        callbacks.len() != before
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks
            .read()
            .expect("No one should panic while holding this lock")
            .len()
    }
}
