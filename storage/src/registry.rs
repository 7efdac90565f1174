use model::{LocalTableName, TableName, Tuple};
use rand::seq::IteratorRandom;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::manager::TupleStoreManager;
use crate::StorageError;

/// All tuple stores of one node.
#[derive(Default)]
pub struct TupleStoreRegistry {
    stores: RwLock<BTreeMap<LocalTableName, Arc<TupleStoreManager>>>,
}

impl TupleStoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, name: &LocalTableName) -> Arc<TupleStoreManager> {
        let mut stores = self
            .stores
            .write()
            .expect("No one should panic while holding this lock");
        stores
            .entry(name.clone())
            .or_insert_with(|| {
                debug!(table = %name, "Creating tuple store");
                Arc::new(TupleStoreManager::new(name.clone()))
            })
            .clone()
    }

    pub fn get(&self, name: &LocalTableName) -> Result<Arc<TupleStoreManager>, StorageError> {
        self.stores
            .read()
            .expect("No one should panic while holding this lock")
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::UnknownTable(name.clone()))
    }

    /// The local shards of `table`, ordered by region.
    pub fn stores_of(&self, table: &TableName) -> Vec<Arc<TupleStoreManager>> {
        self.stores
            .read()
            .expect("No one should panic while holding this lock")
            .iter()
            .filter(|(name, _)| name.table == *table)
            .map(|(_, store)| store.clone())
            .collect()
    }

    pub fn contains_table(&self, table: &TableName) -> bool {
        self.stores
            .read()
            .expect("No one should panic while holding this lock")
            .keys()
            .any(|name| name.table == *table)
    }

    pub fn remove(&self, name: &LocalTableName) -> Option<Arc<TupleStoreManager>> {
        self.stores
            .write()
            .expect("No one should panic while holding this lock")
            .remove(name)
    }

    /// A random live tuple of a random non-empty local store.
    pub fn sample(&self) -> Option<(TableName, Tuple)> {
        let store = self
            .stores
            .read()
            .expect("No one should panic while holding this lock")
            .values()
            .filter(|store| !store.is_empty())
            .choose(&mut rand::rng())
            .cloned()?;
        let tuple = store.sample()?;
        Some((store.name().table.clone(), tuple))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{Hyperrectangle, RegionId};

    #[test]
    fn stores_are_shared_per_local_table() {
        let registry = TupleStoreRegistry::new();
        let table = TableName::new("osm", "cars");
        let first = registry.get_or_create(&table.local(RegionId(1)));
        let again = registry.get_or_create(&table.local(RegionId(1)));
        registry.get_or_create(&table.local(RegionId(2)));
        registry.get_or_create(&TableName::new("osm", "roads").local(RegionId(1)));

        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(registry.stores_of(&table).len(), 2);
        assert_eq!(
            registry.get(&TableName::new("osm", "bikes").local(RegionId(1))).err(),
            Some(StorageError::UnknownTable(TableName::new("osm", "bikes").local(RegionId(1))))
        );
    }

    #[test]
    fn sample_skips_empty_stores() {
        let registry = TupleStoreRegistry::new();
        let table = TableName::new("osm", "cars");
        assert_eq!(registry.sample(), None);

        registry.get_or_create(&table.local(RegionId(1)));
        let store = registry.get_or_create(&table.local(RegionId(2)));
        store.insert(Tuple::new("a", Hyperrectangle::full_space(), "", 1));

        let (sampled_table, tuple) = registry.sample().unwrap();
        assert_eq!(sampled_table, table);
        assert_eq!(tuple.key, "a");
    }
}
