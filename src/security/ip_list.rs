//! IP allow and deny lists.
//!
//! The allow list is a single persistent set. Each deny entry is its own key so
//! that temporary bans can expire independently; an index set keeps the banned
//! addresses enumerable for administration.
//!
//! The `unknown` sentinel is never listed in either direction.

use super::context::UNKNOWN_IP;
use crate::store::{EphemeralStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

const ALLOWLIST_KEY: &str = "ip_allowlist";
const DENYLIST_INDEX_KEY: &str = "ip_denylist";
const DENYLIST_PREFIX: &str = "ip_denylist:";

pub struct IpAccessList {
    store: Arc<dyn EphemeralStore>,
}

impl IpAccessList {
    #[must_use]
    pub fn new(store: Arc<dyn EphemeralStore>) -> Self {
        Self { store }
    }

    fn deny_key(ip: &str) -> String {
        format!("{DENYLIST_PREFIX}{ip}")
    }

    #[instrument(skip(self))]
    pub async fn is_allowlisted(&self, ip: &str) -> bool {
        if ip == UNKNOWN_IP {
            return false;
        }
        self.store
            .set_contains(ALLOWLIST_KEY, ip)
            .await
            .unwrap_or_else(|err| {
                warn!("IP list store unavailable: {err}");
                false
            })
    }

    #[instrument(skip(self))]
    pub async fn is_denylisted(&self, ip: &str) -> bool {
        if ip == UNKNOWN_IP {
            return false;
        }
        match self.store.get(&Self::deny_key(ip)).await {
            Ok(entry) => entry.is_some(),
            Err(err) => {
                warn!("IP list store unavailable: {err}");
                false
            }
        }
    }

    /// # Errors
    /// Returns an error if the store rejects the write.
    #[instrument(skip(self))]
    pub async fn add_to_allowlist(&self, ip: &str) -> Result<(), StoreError> {
        if ip == UNKNOWN_IP {
            return Ok(());
        }
        self.store.set_add(ALLOWLIST_KEY, ip).await?;
        info!("IP added to allow list");
        Ok(())
    }

    /// Ban `ip`, for `ttl` or permanently when `None`.
    ///
    /// # Errors
    /// Returns an error if the store rejects the write.
    #[instrument(skip(self))]
    pub async fn add_to_denylist(&self, ip: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        if ip == UNKNOWN_IP {
            return Ok(());
        }
        self.store.set(&Self::deny_key(ip), "1", ttl).await?;
        self.store.set_add(DENYLIST_INDEX_KEY, ip).await?;
        self.prune_index().await?;
        info!("IP added to deny list");
        Ok(())
    }

    /// # Errors
    /// Returns an error if the store rejects the write.
    #[instrument(skip(self))]
    pub async fn remove_from_allowlist(&self, ip: &str) -> Result<bool, StoreError> {
        self.store.set_remove(ALLOWLIST_KEY, ip).await
    }

    /// # Errors
    /// Returns an error if the store rejects the write.
    #[instrument(skip(self))]
    pub async fn remove_from_denylist(&self, ip: &str) -> Result<bool, StoreError> {
        let removed = self.store.delete(&Self::deny_key(ip)).await?;
        self.store.set_remove(DENYLIST_INDEX_KEY, ip).await?;
        Ok(removed)
    }

    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn allowlisted(&self) -> Result<Vec<String>, StoreError> {
        self.store.set_members(ALLOWLIST_KEY).await
    }

    /// Currently banned addresses. Expired bans are pruned from the index.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn denylisted(&self) -> Result<Vec<String>, StoreError> {
        self.prune_index().await
    }

    /// Remove index members whose ban has expired and return the rest.
    async fn prune_index(&self) -> Result<Vec<String>, StoreError> {
        let mut banned = Vec::new();
        for ip in self.store.set_members(DENYLIST_INDEX_KEY).await? {
            if self.store.get(&Self::deny_key(&ip)).await?.is_some() {
                banned.push(ip);
            } else {
                self.store.set_remove(DENYLIST_INDEX_KEY, &ip).await?;
            }
        }
        Ok(banned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{testing::UnavailableStore, MemoryStore};
    use anyhow::Result;

    fn list() -> (Arc<ManualClock>, IpAccessList) {
        let clock = Arc::new(ManualClock::fixed());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        (clock, IpAccessList::new(store))
    }

    #[tokio::test]
    async fn allow_and_deny_are_independent() -> Result<()> {
        let (_clock, list) = list();
        list.add_to_allowlist("10.0.0.1").await?;
        assert!(list.is_allowlisted("10.0.0.1").await);
        assert!(!list.is_denylisted("10.0.0.1").await);

        list.add_to_denylist("10.0.0.1", None).await?;
        assert!(list.is_allowlisted("10.0.0.1").await);
        assert!(list.is_denylisted("10.0.0.1").await);
        Ok(())
    }

    #[tokio::test]
    async fn temporary_ban_expires() -> Result<()> {
        let (clock, list) = list();
        list.add_to_denylist("9.9.9.9", Some(Duration::from_secs(3600)))
            .await?;
        list.add_to_denylist("8.8.8.8", None).await?;
        assert!(list.is_denylisted("9.9.9.9").await);

        clock.advance(Duration::from_secs(3600));
        assert!(!list.is_denylisted("9.9.9.9").await);
        assert!(list.is_denylisted("8.8.8.8").await);
        assert_eq!(list.denylisted().await?, vec!["8.8.8.8"]);
        Ok(())
    }

    #[tokio::test]
    async fn new_ban_prunes_expired_index_members() -> Result<()> {
        let (clock, list) = list();
        let store = list.store.clone();
        for n in 0..50 {
            list.add_to_denylist(&format!("203.0.113.{n}"), Some(Duration::from_secs(60)))
                .await?;
        }
        assert_eq!(store.set_members(DENYLIST_INDEX_KEY).await?.len(), 50);

        clock.advance(Duration::from_secs(61));
        list.add_to_denylist("198.51.100.7", Some(Duration::from_secs(60)))
            .await?;
        assert_eq!(
            store.set_members(DENYLIST_INDEX_KEY).await?,
            vec!["198.51.100.7"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn removal_lifts_entries() -> Result<()> {
        let (_clock, list) = list();
        list.add_to_allowlist("1.1.1.1").await?;
        list.add_to_denylist("2.2.2.2", None).await?;
        assert!(list.remove_from_allowlist("1.1.1.1").await?);
        assert!(list.remove_from_denylist("2.2.2.2").await?);
        assert!(!list.is_allowlisted("1.1.1.1").await);
        assert!(!list.is_denylisted("2.2.2.2").await);
        assert!(list.denylisted().await?.is_empty());
        assert!(list.allowlisted().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_ip_is_never_listed() -> Result<()> {
        let (_clock, list) = list();
        list.add_to_denylist(UNKNOWN_IP, None).await?;
        list.add_to_allowlist(UNKNOWN_IP).await?;
        assert!(!list.is_denylisted(UNKNOWN_IP).await);
        assert!(!list.is_allowlisted(UNKNOWN_IP).await);
        Ok(())
    }

    #[tokio::test]
    async fn reads_fail_open() {
        let list = IpAccessList::new(Arc::new(UnavailableStore));
        assert!(!list.is_denylisted("1.2.3.4").await);
        assert!(!list.is_allowlisted("1.2.3.4").await);
        assert!(list.add_to_denylist("1.2.3.4", None).await.is_err());
    }
}
