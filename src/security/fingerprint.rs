//! Device fingerprints: an IP-independent hash of the client's browser headers.
//!
//! Each user keeps the ten most recently seen devices, most recent first, under
//! `user_devices:<user_id>`. Seeing a device again moves it to the front, so the
//! device evicted is always the one seen least recently.

use super::context::ClientContext;
use crate::store::EphemeralStore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};

const KEY_PREFIX: &str = "user_devices:";

pub const MAX_DEVICES: usize = 10;
pub const DEVICE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub struct DeviceTracker {
    store: Arc<dyn EphemeralStore>,
}

impl DeviceTracker {
    #[must_use]
    pub fn new(store: Arc<dyn EphemeralStore>) -> Self {
        Self { store }
    }

    fn key(user_id: i64) -> String {
        format!("{KEY_PREFIX}{user_id}")
    }

    /// Hex SHA-256 over user agent, accept-language and accept-encoding, in
    /// that order, each prefixed with its byte length so no header value can
    /// shift bytes into its neighbour.
    #[must_use]
    pub fn fingerprint(ctx: &ClientContext) -> String {
        let mut hasher = Sha256::new();
        for field in [&ctx.user_agent, &ctx.accept_language, &ctx.accept_encoding] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Remember `fingerprint` for the user. Returns `true` when the device was
    /// not known before; store failures report `false`.
    #[instrument(skip(self))]
    pub async fn record(&self, user_id: i64, fingerprint: &str) -> bool {
        let is_new = !self.is_known(user_id, fingerprint).await;
        match self
            .store
            .list_push_front_bounded(&Self::key(user_id), fingerprint, MAX_DEVICES, Some(DEVICE_TTL))
            .await
        {
            Ok(()) => is_new,
            Err(err) => {
                warn!("Device store unavailable, fingerprint not recorded: {err}");
                false
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn is_known(&self, user_id: i64, fingerprint: &str) -> bool {
        self.devices(user_id)
            .await
            .iter()
            .any(|known| known == fingerprint)
    }

    /// Known fingerprints, most recently seen first.
    pub async fn devices(&self, user_id: i64) -> Vec<String> {
        self.store
            .list_range(&Self::key(user_id))
            .await
            .unwrap_or_else(|err| {
                warn!("Device store unavailable: {err}");
                Vec::new()
            })
    }
}
