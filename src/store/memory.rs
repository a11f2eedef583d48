//! In-process session store with per-key TTLs.
//!
//! Suitable for a single instance (which is all server instance binding allows
//! anyway) and for tests. Expired entries are invisible to reads immediately and
//! are physically removed by [`SessionStore::purge_expired`].

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::RwLock, time::Instant};

use super::{SessionStore, StoreFuture};

#[derive(Debug)]
enum Slot {
    Value(String),
    Set(BTreeSet<String>),
}

#[derive(Debug)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| expires_at > now)
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries, mostly useful for diagnostics and tests.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl SessionStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let entries = self.entries.read().await;
            let value = entries
                .get(key)
                .filter(|entry| entry.is_live(Instant::now()))
                .and_then(|entry| match &entry.slot {
                    Slot::Value(value) => Some(value.clone()),
                    Slot::Set(_) => None,
                });
            Ok(value)
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let expires_at = ttl.map(|ttl| Instant::now() + ttl);
            self.entries.write().await.insert(
                key.to_string(),
                Entry {
                    slot: Slot::Value(value.to_string()),
                    expires_at,
                },
            );
            Ok(())
        })
    }

    fn replace<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.write().await;
            match entries.get_mut(key) {
                Some(entry) if entry.is_live(now) && matches!(entry.slot, Slot::Value(_)) => {
                    entry.slot = Slot::Value(value.to_string());
                    entry.expires_at = ttl.map(|ttl| now + ttl);
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let removed = self.entries.write().await.remove(key);
            Ok(removed.is_some_and(|entry| entry.is_live(Instant::now())))
        })
    }

    fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.write().await;
            match entries.get_mut(key) {
                Some(entry) if entry.is_live(now) => {
                    entry.expires_at = Some(now + ttl);
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn set_add<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.write().await;
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                slot: Slot::Set(BTreeSet::new()),
                expires_at: None,
            });
            // A stale or mistyped slot under this key is replaced by a fresh set.
            if !entry.is_live(now) || matches!(entry.slot, Slot::Value(_)) {
                entry.slot = Slot::Set(BTreeSet::new());
                entry.expires_at = None;
            }
            if let Slot::Set(members) = &mut entry.slot {
                members.insert(member.to_string());
            }
            Ok(())
        })
    }

    fn set_remove<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut entries = self.entries.write().await;
            let now_empty = match entries.get_mut(key) {
                Some(Entry {
                    slot: Slot::Set(members),
                    ..
                }) => {
                    members.remove(member);
                    members.is_empty()
                }
                _ => false,
            };
            if now_empty {
                entries.remove(key);
            }
            Ok(())
        })
    }

    fn set_members<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let entries = self.entries.read().await;
            let members = entries
                .get(key)
                .filter(|entry| entry.is_live(Instant::now()))
                .map(|entry| match &entry.slot {
                    Slot::Set(members) => members.iter().cloned().collect(),
                    Slot::Value(_) => Vec::new(),
                })
                .unwrap_or_default();
            Ok(members)
        })
    }

    fn keys<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let now = Instant::now();
            let entries = self.entries.read().await;
            let mut keys: Vec<String> = entries
                .iter()
                .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
                .map(|(key, _)| key.clone())
                .collect();
            keys.sort();
            Ok(keys)
        })
    }

    fn purge_expired(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.write().await;
            let before = entries.len();
            entries.retain(|_, entry| entry.is_live(now));
            Ok(u64::try_from(before - entries.len()).unwrap_or(u64::MAX))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    #[tokio::test]
    async fn set_get_delete() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        store.set("k", "v", None).await?;
        assert_eq!(store.get("k").await?, Some("v".to_string()));
        assert!(store.delete("k").await?);
        assert_eq!(store.get("k").await?, None);
        assert!(!store.delete("k").await?);
        Ok(())
    }

    #[tokio::test]
    async fn ttl_hides_expired_values() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        store
            .set("short", "v", Some(Duration::from_millis(30)))
            .await?;
        assert!(store.get("short").await?.is_some());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("short").await?, None);
        assert!(!store.expire("short", Duration::from_secs(5)).await?);
        assert_eq!(store.purge_expired().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn replace_never_recreates_a_deleted_value() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        assert!(!store.replace("k", "v2", None).await?);
        assert_eq!(store.get("k").await?, None);

        store.set("k", "v1", None).await?;
        assert!(store.replace("k", "v2", Some(Duration::from_millis(30))).await?);
        assert_eq!(store.get("k").await?, Some("v2".to_string()));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!store.replace("k", "v3", None).await?);
        assert_eq!(store.get("k").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn expire_shortens_lifetime() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        store.set("k", "v", None).await?;
        assert!(store.expire("k", Duration::from_millis(30)).await?);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn sets_track_members() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        store.set_add("s", "b").await?;
        store.set_add("s", "a").await?;
        store.set_add("s", "a").await?;
        assert_eq!(store.set_members("s").await?, vec!["a", "b"]);

        store.set_remove("s", "a").await?;
        assert_eq!(store.set_members("s").await?, vec!["b"]);

        store.set_remove("s", "b").await?;
        assert!(store.set_members("s").await?.is_empty());
        assert!(store.keys("s").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn keys_filter_by_prefix() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        store.set("session:1", "x", None).await?;
        store.set("session:2", "y", None).await?;
        store.set_add("user_tokens:alice", "1").await?;
        assert_eq!(
            store.keys("session:").await?,
            vec!["session:1".to_string(), "session:2".to_string()]
        );
        assert_eq!(store.keys("user_tokens:").await?.len(), 1);
        assert_eq!(store.len().await, 3);
        Ok(())
    }
}
