//! In-process [`EphemeralStore`] backed by a mutex-guarded map.
//!
//! Expiry is evaluated lazily against the injected [`Clock`], so tests can move
//! time forward without sleeping. Keys that are never read again are reclaimed
//! by a sweep that runs on the first write after each [`SWEEP_INTERVAL_SECS`].

use super::{EphemeralStore, StoreError};
use crate::clock::{delta, Clock, SystemClock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

pub const SWEEP_INTERVAL_SECS: i64 = 60;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(BTreeSet<String>),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    // unix seconds; only touched while `entries` is locked
    next_sweep: AtomicI64,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let next_sweep = clock.now().timestamp() + SWEEP_INTERVAL_SECS;
        Self {
            entries: Mutex::new(HashMap::new()),
            next_sweep: AtomicI64::new(next_sweep),
            clock,
        }
    }

    /// Drop every expired entry when the sweep is due.
    fn sweep(&self, entries: &mut HashMap<String, Entry>, now: DateTime<Utc>) {
        if now.timestamp() < self.next_sweep.load(Ordering::Relaxed) {
            return;
        }
        self.next_sweep
            .store(now.timestamp() + SWEEP_INTERVAL_SECS, Ordering::Relaxed);
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let reclaimed = before - entries.len();
        if reclaimed > 0 {
            debug!(reclaimed, remaining = entries.len(), "Expired keys reclaimed");
        }
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|ttl| self.clock.now() + delta(ttl))
    }

    /// Remaining time to live of a key, `None` when absent or persistent.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        let entry = entries.get(key).filter(|e| !e.is_expired(now))?;
        entry
            .expires_at
            .and_then(|at| (at - now).to_std().ok())
    }
}

/// Drop the entry if it has expired and hand back the live one, if any.
fn live<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: DateTime<Utc>,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|e| e.is_expired(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

#[async_trait]
impl EphemeralStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.lock().await;
        self.sweep(&mut entries, now);
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        Ok(entries.remove(key).is_some_and(|e| !e.is_expired(now)))
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, StoreError> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.lock().await;
        self.sweep(&mut entries, now);
        match live(&mut entries, key, now) {
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Str("1".to_string()),
                        expires_at,
                    },
                );
                Ok(1)
            }
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => {
                let next = s
                    .parse::<i64>()
                    .map_err(|_| StoreError::WrongType(key.to_string()))?
                    .saturating_add(1);
                *s = next.to_string();
                Ok(next)
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        self.sweep(&mut entries, now);
        match live(&mut entries, key, now) {
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Set(BTreeSet::from([member.to_string()])),
                        expires_at: None,
                    },
                );
                Ok(())
            }
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => {
                set.insert(member.to_string());
                Ok(())
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key, now) {
            None => Ok(false),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.remove(member)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key, now) {
            None => Ok(false),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.contains(member)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key, now) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn list_push_front_bounded(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.lock().await;
        self.sweep(&mut entries, now);
        match live(&mut entries, key, now) {
            None => {
                let mut list = VecDeque::from([value.to_string()]);
                list.truncate(max_len);
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::List(list),
                        expires_at,
                    },
                );
                Ok(())
            }
            Some(entry) => {
                let Value::List(list) = &mut entry.value else {
                    return Err(StoreError::WrongType(key.to_string()));
                };
                list.retain(|item| item != value);
                list.push_front(value.to_string());
                list.truncate(max_len);
                entry.expires_at = expires_at;
                Ok(())
            }
        }
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key, now) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use anyhow::Result;

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::fixed());
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn values_expire_after_ttl() -> Result<()> {
        let (clock, store) = store();
        store
            .set("greeting", "hello", Some(Duration::from_secs(10)))
            .await?;
        assert_eq!(store.get("greeting").await?.as_deref(), Some("hello"));

        clock.advance(Duration::from_secs(9));
        assert_eq!(store.ttl("greeting").await, Some(Duration::from_secs(1)));

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get("greeting").await?, None);
        assert!(!store.delete("greeting").await?);
        Ok(())
    }

    #[tokio::test]
    async fn values_without_ttl_persist() -> Result<()> {
        let (clock, store) = store();
        store.set("k", "v", None).await?;
        clock.advance(Duration::from_secs(86_400 * 365));
        assert_eq!(store.get("k").await?.as_deref(), Some("v"));
        assert_eq!(store.ttl("k").await, None);
        Ok(())
    }

    #[tokio::test]
    async fn incr_sets_ttl_only_on_creation() -> Result<()> {
        let (clock, store) = store();
        let ttl = Some(Duration::from_secs(60));
        assert_eq!(store.incr("c", ttl).await?, 1);
        clock.advance(Duration::from_secs(30));
        assert_eq!(store.incr("c", ttl).await?, 2);
        clock.advance(Duration::from_secs(30));
        // the original 60s elapsed; the counter starts over
        assert_eq!(store.incr("c", ttl).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn incr_rejects_non_numeric_values() -> Result<()> {
        let (_clock, store) = store();
        store.set("c", "abc", None).await?;
        assert!(matches!(
            store.incr("c", None).await,
            Err(StoreError::WrongType(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn set_operations() -> Result<()> {
        let (_clock, store) = store();
        store.set_add("s", "b").await?;
        store.set_add("s", "a").await?;
        store.set_add("s", "a").await?;
        assert!(store.set_contains("s", "a").await?);
        assert_eq!(store.set_members("s").await?, vec!["a", "b"]);
        assert!(store.set_remove("s", "a").await?);
        assert!(!store.set_remove("s", "a").await?);
        assert!(!store.set_contains("missing", "a").await?);
        Ok(())
    }

    #[tokio::test]
    async fn wrong_type_is_reported() -> Result<()> {
        let (_clock, store) = store();
        store.set_add("s", "a").await?;
        assert!(matches!(store.get("s").await, Err(StoreError::WrongType(_))));
        Ok(())
    }

    #[tokio::test]
    async fn bounded_list_moves_duplicates_to_front_and_evicts_tail() -> Result<()> {
        let (clock, store) = store();
        let ttl = Some(Duration::from_secs(100));
        for item in ["a", "b", "c"] {
            store.list_push_front_bounded("l", item, 3, ttl).await?;
        }
        assert_eq!(store.list_range("l").await?, vec!["c", "b", "a"]);

        store.list_push_front_bounded("l", "a", 3, ttl).await?;
        assert_eq!(store.list_range("l").await?, vec!["a", "c", "b"]);

        store.list_push_front_bounded("l", "d", 3, ttl).await?;
        assert_eq!(store.list_range("l").await?, vec!["d", "a", "c"]);

        // each push renews the TTL of the whole list
        clock.advance(Duration::from_secs(90));
        store.list_push_front_bounded("l", "e", 3, ttl).await?;
        clock.advance(Duration::from_secs(90));
        assert_eq!(store.list_range("l").await?, vec!["e", "d", "a"]);
        Ok(())
    }

    #[tokio::test]
    async fn unread_expired_keys_are_reclaimed_on_write() -> Result<()> {
        let (clock, store) = store();
        let ttl = Some(Duration::from_secs(60));
        for n in 0..1000 {
            store
                .incr(&format!("login_attempts:1.2.3.4:user{n}"), ttl)
                .await?;
        }
        store.set("persistent", "1", None).await?;
        assert_eq!(store.entries.lock().await.len(), 1001);

        clock.advance(Duration::from_secs(3600));
        store.set("unrelated", "1", Some(Duration::from_secs(5))).await?;
        let entries = store.entries.lock().await;
        assert_eq!(entries.len(), 2);
        assert!(entries.contains_key("persistent"));
        Ok(())
    }

    #[tokio::test]
    async fn sweep_waits_for_its_interval() -> Result<()> {
        let (clock, store) = store();
        store.set("a", "1", Some(Duration::from_secs(1))).await?;
        clock.advance(Duration::from_secs(2));
        // expired, but the first sweep is not due yet
        store.set("b", "1", None).await?;
        assert_eq!(store.entries.lock().await.len(), 2);

        clock.advance(Duration::from_secs(60));
        store.set_add("c", "x").await?;
        assert_eq!(store.entries.lock().await.len(), 2);
        Ok(())
    }
}
