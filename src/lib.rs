//! # Bastion (Login Security & Access Control)
//!
//! `bastion` guards the login path and answers authorization questions for the
//! rest of the backend.
//!
//! ## Login Security
//!
//! A login attempt walks a fixed sequence of checks before any token is issued:
//!
//! - **IP deny list:** banned addresses are rejected before anything else.
//! - **Attempt limiter:** failures are counted per `ip:username` identifier inside
//!   a rolling window; reaching the limit locks the identifier for a while.
//! - **Challenge escalation:** when only a couple of attempts remain, a one-shot
//!   challenge (CAPTCHA) must accompany the credentials.
//! - **Auto-ban:** an address that keeps failing across usernames is deny-listed
//!   for an hour.
//! - **Device fingerprint:** successful logins record an IP-independent device hash.
//!
//! All transient counters live in an [`store::EphemeralStore`]. When that store is
//! unreachable the login path fails open: counters are skipped, logins proceed.
//!
//! ## Access Control (RBAC)
//!
//! Users receive roles (optionally time-bounded), roles receive permissions, and
//! permissions form an acyclic tree. Resolved role and permission sets are cached
//! for five minutes per user and invalidated on every administrative change.
//! Superusers bypass resolution entirely. Lookups that cannot reach the relational
//! store fail closed and resolve to "no permissions".

pub mod api;
pub mod auth;
pub mod cli;
pub mod clock;
pub mod rbac;
pub mod security;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
