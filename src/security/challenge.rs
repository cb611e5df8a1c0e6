//! One-shot CAPTCHA challenges keyed by requester (client IP).
//!
//! The rendered image is a small SVG with jittered glyphs and noise; only the
//! plaintext is security relevant. Solutions are stored lowercased under
//! `captcha:<identifier>` and deleted by the first verification attempt.

use crate::store::{EphemeralStore, StoreError};
use base64ct::{Base64, Encoding};
use rand::Rng;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const KEY_PREFIX: &str = "captcha:";
const WIDTH: u32 = 120;
const HEIGHT: u32 = 40;

pub const DEFAULT_LENGTH: usize = 4;
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// A freshly generated challenge. `image` is a `data:` URI.
#[derive(Clone)]
pub struct Challenge {
    pub text: String,
    pub image: String,
}

impl std::fmt::Debug for Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Challenge")
            .field("text", &"[redacted]")
            .field("image_len", &self.image.len())
            .finish()
    }
}

pub struct ChallengeManager {
    store: Arc<dyn EphemeralStore>,
    ttl: Duration,
}

impl ChallengeManager {
    #[must_use]
    pub fn new(store: Arc<dyn EphemeralStore>) -> Self {
        Self {
            store,
            ttl: DEFAULT_TTL,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn key(identifier: &str) -> String {
        format!("{KEY_PREFIX}{identifier}")
    }

    /// Random digits plus their rendering.
    #[must_use]
    pub fn generate(length: usize) -> Challenge {
        let mut rng = rand::thread_rng();
        let text: String = (0..length.max(1))
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect();
        let image = render(&text, &mut rng);
        Challenge { text, image }
    }

    /// Replace any live challenge for `identifier` with `text`.
    ///
    /// # Errors
    /// Returns an error if the store rejects the write.
    #[instrument(skip(self, text))]
    pub async fn store(&self, text: &str, identifier: &str) -> Result<(), StoreError> {
        self.store
            .set(&Self::key(identifier), &text.to_lowercase(), Some(self.ttl))
            .await
    }

    /// Generate, store and return a challenge for `identifier`.
    ///
    /// # Errors
    /// Returns an error if the store rejects the write.
    pub async fn issue(&self, identifier: &str) -> Result<Challenge, StoreError> {
        let challenge = Self::generate(DEFAULT_LENGTH);
        self.store(&challenge.text, identifier).await?;
        Ok(challenge)
    }

    /// Case-insensitive comparison. The stored solution is consumed whatever
    /// the outcome.
    #[instrument(skip(self, candidate))]
    pub async fn verify(&self, candidate: &str, identifier: &str) -> bool {
        let key = Self::key(identifier);
        let stored = match self.store.get(&key).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return false,
            Err(err) => {
                warn!("Challenge store unavailable: {err}");
                return false;
            }
        };

        if let Err(err) = self.store.delete(&key).await {
            warn!("Failed to consume challenge: {err}");
        }

        let matched = candidate.trim().to_lowercase() == stored;
        debug!(matched, "challenge verified");
        matched
    }
}

fn render(text: &str, rng: &mut impl Rng) -> String {
    let mut svg = format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{HEIGHT}" viewBox="0 0 {WIDTH} {HEIGHT}"><rect width="100%" height="100%" fill="#ffffff"/>"##
    );

    for _ in 0..3 {
        let _ = write!(
            svg,
            r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="rgb({},{},{})" stroke-width="1"/>"#,
            rng.gen_range(0..=WIDTH),
            rng.gen_range(0..=HEIGHT),
            rng.gen_range(0..=WIDTH),
            rng.gen_range(0..=HEIGHT),
            rng.gen_range(100..=200u8),
            rng.gen_range(100..=200u8),
            rng.gen_range(100..=200u8),
        );
    }

    let count = u32::try_from(text.chars().count()).unwrap_or(1).max(1);
    let step = WIDTH / (count + 1);
    for (i, ch) in (1u32..).zip(text.chars()) {
        let x = step * i;
        let y = HEIGHT / 2 + 8;
        let _ = write!(
            svg,
            r##"<text x="{x}" y="{y}" font-family="monospace" font-size="24" fill="#000000" text-anchor="middle" transform="rotate({} {x} {y})">{ch}</text>"##,
            rng.gen_range(-20..=20i32),
        );
    }

    for _ in 0..20 {
        let _ = write!(
            svg,
            r#"<circle cx="{}" cy="{}" r="1" fill="rgb({},{},{})"/>"#,
            rng.gen_range(0..=WIDTH),
            rng.gen_range(0..=HEIGHT),
            rng.gen::<u8>(),
            rng.gen::<u8>(),
            rng.gen::<u8>(),
        );
    }

    svg.push_str("</svg>");
    format!("data:image/svg+xml;base64,{}", Base64::encode_string(svg.as_bytes()))
}
