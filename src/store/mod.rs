//! Ephemeral key-value store used for every transient counter and set.
//!
//! The login path treats this store as lossy: data may disappear at any time
//! (TTL, eviction, restart) and callers must keep working when it errors.
//! Components receive it as an `Arc<dyn EphemeralStore>` so tests can swap in
//! the in-memory implementation or a failing one.

use async_trait::async_trait;
use std::time::Duration;

mod memory;

pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Key {0} holds a value of another type")]
    WrongType(String),
}

#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// Read a string value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a string value, replacing whatever was there. `None` keeps it forever.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Remove a key of any type. Returns whether something was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically increment an integer counter, creating it at 1 with `ttl`.
    /// The TTL is not extended on later increments.
    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Move `value` to the front of the list (removing earlier copies), trim the
    /// list to `max_len` and renew the TTL of the whole list.
    async fn list_push_front_bounded(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Full list, front first.
    async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError>;
}
