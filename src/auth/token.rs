//! HS256 access/refresh token pairs.
//!
//! Flow Overview:
//! 1) A successful login gets a short-lived access token and a long-lived
//!    refresh token, both signed with the same HMAC secret.
//! 2) Refreshing rotates: the presented refresh token's `jti` is written to
//!    `token_blacklist:<jti>` until its own expiry and a new pair is issued.
//! 3) Logout blacklists the refresh token the same way.
//!
//! Refresh verification needs the ephemeral store; when it is unreachable the
//! token is refused rather than accepted unchecked.

use super::identity::Principal;
use crate::clock::{delta, Clock};
use crate::store::{EphemeralStore, StoreError};
use async_trait::async_trait;
use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "HS256";
const BLACKLIST_PREFIX: &str = "token_blacklist:";

#[derive(Clone, Debug)]
pub struct TokenConfig {
    secret: SecretString,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenConfig {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            issuer: "bastion".to_string(),
            access_ttl: Duration::from_secs(15 * 60),
            refresh_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    #[must_use]
    pub fn with_access_ttl(mut self, ttl: Duration) -> Self {
        self.access_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    #[must_use]
    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Header {
    alg: String,
    typ: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub typ: TokenKind,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    pub iss: String,
    #[serde(default)]
    pub is_superuser: bool,
}

impl Claims {
    /// Numeric user id carried in `sub`.
    ///
    /// # Errors
    /// Returns [`TokenError::TokenFormat`] if `sub` is not an integer.
    pub fn user_id(&self) -> Result<i64, TokenError> {
        self.sub.parse().map_err(|_| TokenError::TokenFormat)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
    pub refresh_expires_in: u64,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("invalid signing key")]
    Key,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("unexpected token type")]
    WrongKind,
    #[error("token revoked")]
    Revoked,
    #[error("token subject is missing or disabled")]
    InactiveSubject,
    #[error("token store unavailable: {0}")]
    Unavailable(#[from] StoreError),
}

#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self, principal: &Principal) -> Result<TokenPair, TokenError>;

    /// Decode and validate `token`, which must be of `kind`.
    async fn verify(&self, token: &str, kind: TokenKind) -> Result<Claims, TokenError>;

    /// Refuse `claims` from now until they expire.
    async fn revoke(&self, claims: &Claims) -> Result<(), TokenError>;
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, TokenError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| TokenError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub struct JwtIssuer {
    config: TokenConfig,
    store: Arc<dyn EphemeralStore>,
    clock: Arc<dyn Clock>,
}

impl JwtIssuer {
    #[must_use]
    pub fn new(config: TokenConfig, store: Arc<dyn EphemeralStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    #[must_use]
    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    fn mac(&self) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(self.config.secret.expose_secret().as_bytes())
            .map_err(|_| TokenError::Key)
    }

    fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        let header = Header {
            alg: ALGORITHM.to_string(),
            typ: "JWT".to_string(),
        };
        let signing_input = format!("{}.{}", b64e_json(&header)?, b64e_json(claims)?);
        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = Base64UrlUnpadded::encode_string(&mac.finalize().into_bytes());
        Ok(format!("{signing_input}.{signature}"))
    }

    fn claims(&self, principal: &Principal, typ: TokenKind, ttl: Duration) -> Claims {
        let now = self.clock.now();
        Claims {
            sub: principal.id.to_string(),
            username: principal.username.clone(),
            typ,
            iat: now.timestamp(),
            exp: (now + delta(ttl)).timestamp(),
            jti: Uuid::new_v4().to_string(),
            iss: self.config.issuer.clone(),
            is_superuser: principal.is_superuser,
        }
    }

    fn decode(&self, token: &str) -> Result<Claims, TokenError> {
        let parts: Vec<&str> = token.split('.').collect();
        let [header_b64, claims_b64, signature_b64] = parts.as_slice() else {
            return Err(TokenError::TokenFormat);
        };

        let header: Header = b64d_json(header_b64)?;
        if header.alg != ALGORITHM {
            return Err(TokenError::UnsupportedAlg(header.alg));
        }

        let signature =
            Base64UrlUnpadded::decode_vec(signature_b64).map_err(|_| TokenError::Base64)?;
        let mut mac = self.mac()?;
        mac.update(format!("{header_b64}.{claims_b64}").as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let claims: Claims = b64d_json(claims_b64)?;
        if claims.iss != self.config.issuer {
            return Err(TokenError::InvalidIssuer);
        }
        if claims.exp <= self.clock.now().timestamp() {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

#[async_trait]
impl TokenIssuer for JwtIssuer {
    #[instrument(skip(self, principal), fields(user_id = principal.id))]
    async fn issue(&self, principal: &Principal) -> Result<TokenPair, TokenError> {
        let access = self.claims(principal, TokenKind::Access, self.config.access_ttl);
        let refresh = self.claims(principal, TokenKind::Refresh, self.config.refresh_ttl);
        Ok(TokenPair {
            access_token: self.sign(&access)?,
            refresh_token: self.sign(&refresh)?,
            token_type: "Bearer".to_string(),
            expires_in: self.config.access_ttl.as_secs(),
            refresh_expires_in: self.config.refresh_ttl.as_secs(),
        })
    }

    #[instrument(skip(self, token))]
    async fn verify(&self, token: &str, kind: TokenKind) -> Result<Claims, TokenError> {
        let claims = self.decode(token)?;
        if claims.typ != kind {
            return Err(TokenError::WrongKind);
        }
        if kind == TokenKind::Refresh {
            let key = format!("{BLACKLIST_PREFIX}{}", claims.jti);
            if self.store.get(&key).await?.is_some() {
                debug!(jti = %claims.jti, "refresh token is blacklisted");
                return Err(TokenError::Revoked);
            }
        }
        Ok(claims)
    }

    #[instrument(skip(self, claims), fields(jti = %claims.jti))]
    async fn revoke(&self, claims: &Claims) -> Result<(), TokenError> {
        let left = claims.exp - self.clock.now().timestamp();
        let Ok(left) = u64::try_from(left) else {
            return Ok(());
        };
        if left == 0 {
            return Ok(());
        }
        let key = format!("{BLACKLIST_PREFIX}{}", claims.jti);
        self.store
            .set(&key, "1", Some(Duration::from_secs(left)))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{testing::UnavailableStore, MemoryStore};
    use anyhow::Result;

    fn principal() -> Principal {
        Principal {
            id: 42,
            username: "alice".to_string(),
            is_active: true,
            is_superuser: false,
        }
    }

    fn issuer() -> (Arc<ManualClock>, JwtIssuer) {
        let clock = Arc::new(ManualClock::fixed());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let config = TokenConfig::new(SecretString::from("test-secret".to_string()));
        (clock.clone(), JwtIssuer::new(config, store, clock))
    }

    #[tokio::test]
    async fn issued_tokens_verify_with_their_kind() -> Result<()> {
        let (_clock, issuer) = issuer();
        let pair = issuer.issue(&principal()).await?;
        assert_eq!(pair.token_type, "Bearer");
        assert_eq!(pair.expires_in, 900);
        assert_eq!(pair.refresh_expires_in, 604_800);

        let access = issuer.verify(&pair.access_token, TokenKind::Access).await?;
        assert_eq!(access.user_id()?, 42);
        assert_eq!(access.username, "alice");
        assert_eq!(access.iss, "bastion");

        let refresh = issuer.verify(&pair.refresh_token, TokenKind::Refresh).await?;
        assert_ne!(access.jti, refresh.jti);

        assert!(matches!(
            issuer.verify(&pair.access_token, TokenKind::Refresh).await,
            Err(TokenError::WrongKind)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn tampered_tokens_are_rejected() -> Result<()> {
        let (_clock, issuer) = issuer();
        let pair = issuer.issue(&principal()).await?;

        let mut parts: Vec<String> = pair.access_token.split('.').map(String::from).collect();
        let mut claims: Claims = b64d_json(&parts[1])?;
        claims.is_superuser = true;
        parts[1] = b64e_json(&claims)?;
        let forged = parts.join(".");

        assert!(matches!(
            issuer.verify(&forged, TokenKind::Access).await,
            Err(TokenError::InvalidSignature)
        ));
        assert!(matches!(
            issuer.verify("a.b", TokenKind::Access).await,
            Err(TokenError::TokenFormat)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn unsigned_tokens_are_rejected() -> Result<()> {
        let (_clock, issuer) = issuer();
        let header = b64e_json(&Header {
            alg: "none".to_string(),
            typ: "JWT".to_string(),
        })?;
        let pair = issuer.issue(&principal()).await?;
        let claims = pair.access_token.split('.').nth(1).unwrap_or_default();
        let token = format!("{header}.{claims}.");
        assert!(matches!(
            issuer.verify(&token, TokenKind::Access).await,
            Err(TokenError::UnsupportedAlg(alg)) if alg == "none"
        ));
        Ok(())
    }

    #[tokio::test]
    async fn access_tokens_expire() -> Result<()> {
        let (clock, issuer) = issuer();
        let pair = issuer.issue(&principal()).await?;
        clock.advance(Duration::from_secs(15 * 60));
        assert!(matches!(
            issuer.verify(&pair.access_token, TokenKind::Access).await,
            Err(TokenError::Expired)
        ));
        assert!(issuer.verify(&pair.refresh_token, TokenKind::Refresh).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn other_issuers_are_rejected() -> Result<()> {
        let (clock, issuer) = issuer();
        let pair = issuer.issue(&principal()).await?;
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let config =
            TokenConfig::new(SecretString::from("test-secret".to_string())).with_issuer("other");
        let other = JwtIssuer::new(config, store, clock);
        assert!(matches!(
            other.verify(&pair.access_token, TokenKind::Access).await,
            Err(TokenError::InvalidIssuer)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn revoked_refresh_tokens_are_refused_until_expiry() -> Result<()> {
        let (_clock, issuer) = issuer();
        let pair = issuer.issue(&principal()).await?;
        let claims = issuer.verify(&pair.refresh_token, TokenKind::Refresh).await?;
        issuer.revoke(&claims).await?;
        assert!(matches!(
            issuer.verify(&pair.refresh_token, TokenKind::Refresh).await,
            Err(TokenError::Revoked)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn refresh_verification_fails_closed_without_store() -> Result<()> {
        let clock = Arc::new(ManualClock::fixed());
        let config = TokenConfig::new(SecretString::from("test-secret".to_string()));
        let issuer = JwtIssuer::new(config, Arc::new(UnavailableStore), clock);
        let pair = issuer.issue(&principal()).await?;
        assert!(issuer.verify(&pair.access_token, TokenKind::Access).await.is_ok());
        assert!(matches!(
            issuer.verify(&pair.refresh_token, TokenKind::Refresh).await,
            Err(TokenError::Unavailable(_))
        ));
        Ok(())
    }
}
