//! Brute-force defenses for the login path.
//!
//! Every component here keeps its state in the shared [`EphemeralStore`] and
//! fails open when the store is unreachable: a cache outage must never lock
//! users out of their accounts.
//!
//! [`EphemeralStore`]: crate::store::EphemeralStore

pub mod attempts;
pub mod challenge;
pub mod context;
pub mod fingerprint;
pub mod ip_list;

pub use attempts::{AttemptPolicy, AttemptStatus, LoginAttemptLimiter};
pub use challenge::{Challenge, ChallengeManager};
pub use context::{ClientContext, UNKNOWN_IP};
pub use fingerprint::DeviceTracker;
pub use ip_list::IpAccessList;
