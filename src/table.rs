//! Lock owning map shared between concurrent conversations.
//!
//! Each concern (exchanges, block transfers, observations) owns one [`Table`].  Every
//! operation takes the lock for its own duration only, so callers never hold two table
//! locks at once and never perform I/O while holding one.

use std::collections::HashMap;
use std::hash::Hash;

use tokio::sync::RwLock;

#[derive(Debug)]
pub struct Table<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K: Eq + Hash, V> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash, V> Table<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &K) -> bool {
        self.entries.read().await.contains_key(key)
    }

    pub async fn insert(&self, key: K, value: V) -> Option<V> {
        self.entries.write().await.insert(key, value)
    }

    pub async fn remove(&self, key: &K) -> Option<V> {
        self.entries.write().await.remove(key)
    }

    /// Applies `f` to the entry under `key`, if present, and returns its result.
    pub async fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.entries.write().await.get_mut(key).map(f)
    }

    /// Runs a compound check-and-modify operation atomically against the whole map.
    pub async fn modify<R>(&self, f: impl FnOnce(&mut HashMap<K, V>) -> R) -> R {
        f(&mut *self.entries.write().await)
    }

    /// Runs a read-only query against the whole map.
    pub async fn read<R>(&self, f: impl FnOnce(&HashMap<K, V>) -> R) -> R {
        f(&*self.entries.read().await)
    }

    pub async fn retain(&self, f: impl FnMut(&K, &mut V) -> bool) {
        self.entries.write().await.retain(f);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_operations() {
        let table = Table::new();
        assert!(table.insert("a", 1).await.is_none());
        assert_eq!(table.insert("a", 2).await, Some(1));
        assert_eq!(table.get(&"a").await, Some(2));
        assert_eq!(table.update(&"a", |v| std::mem::replace(v, 3)).await, Some(2));
        assert_eq!(table.update(&"b", |v| *v).await, None);
        assert_eq!(table.remove(&"a").await, Some(3));
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_modify_is_atomic_check_and_insert() {
        let table = Table::new();
        let first = table.modify(|map| map.insert(7u16, "x").is_none()).await;
        let second = table.modify(|map| map.insert(7u16, "y").is_none()).await;
        assert!(first);
        assert!(!second);
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_retain() {
        let table = Table::new();
        for i in 0..10 {
            table.insert(i, i * 10).await;
        }
        table.retain(|k, _| k % 2 == 0).await;
        assert_eq!(table.len().await, 5);
        assert!(!table.contains(&3).await);
        assert_eq!(table.read(|map| map.values().sum::<i32>()).await, 200);
    }
}
