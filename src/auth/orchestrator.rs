//! Login state machine.
//!
//! Flow Overview:
//! 1) Reject empty usernames or passwords.
//! 2) Reject deny-listed client addresses.
//! 3) Reject identifiers (`ip:username`) that are locked out.
//! 4) When few attempts remain, require and consume a challenge solution. A
//!    wrong solution counts as a failure.
//! 5) Verify credentials. A failure is counted for the identifier and for the
//!    address; an address that keeps failing is deny-listed for a while.
//! 6) Reject inactive accounts.
//! 7) Clear the identifier, record the device and issue tokens.
//!
//! Each refusal is a [`Rejection`] value and is audited with the stage it
//! happened at. Identity and token failures propagate as [`AuthError`].

use super::audit::{AuditEvent, AuditSink};
use super::identity::{validate_password, validate_username, IdentityError, IdentityStore};
use super::token::{TokenError, TokenIssuer, TokenKind, TokenPair};
use super::types::{
    LoginOutcome, LoginRequest, LoginStage, LoginSuccess, RegisterRequest, Rejection, UserSummary,
};
use super::AuthError;
use crate::clock::Clock;
use crate::security::{
    AttemptPolicy, Challenge, ChallengeManager, ClientContext, DeviceTracker, IpAccessList,
    LoginAttemptLimiter,
};
use crate::store::{EphemeralStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const IP_FAILURES_PREFIX: &str = "login_ip_failures:";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoginPolicy {
    challenge_threshold: u32,
    auto_ban_threshold: u32,
    auto_ban_duration: Duration,
}

impl Default for LoginPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl LoginPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self {
            challenge_threshold: 2,
            auto_ban_threshold: 10,
            auto_ban_duration: Duration::from_secs(60 * 60),
        }
    }

    /// A challenge is required once remaining attempts drop to this value.
    #[must_use]
    pub fn with_challenge_threshold(mut self, threshold: u32) -> Self {
        self.challenge_threshold = threshold;
        self
    }

    /// Credential failures from one address before it is deny-listed.
    #[must_use]
    pub fn with_auto_ban_threshold(mut self, threshold: u32) -> Self {
        self.auto_ban_threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn with_auto_ban_duration(mut self, duration: Duration) -> Self {
        self.auto_ban_duration = duration;
        self
    }

    #[must_use]
    pub fn challenge_threshold(&self) -> u32 {
        self.challenge_threshold
    }

    #[must_use]
    pub fn auto_ban_threshold(&self) -> u32 {
        self.auto_ban_threshold
    }

    #[must_use]
    pub fn auto_ban_duration(&self) -> Duration {
        self.auto_ban_duration
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuthConfig {
    pub attempts: AttemptPolicy,
    pub login: LoginPolicy,
}

pub struct Authenticator {
    store: Arc<dyn EphemeralStore>,
    limiter: LoginAttemptLimiter,
    ip_list: IpAccessList,
    challenges: ChallengeManager,
    devices: DeviceTracker,
    identity: Arc<dyn IdentityStore>,
    tokens: Arc<dyn TokenIssuer>,
    audit: Arc<dyn AuditSink>,
    policy: LoginPolicy,
}

impl Authenticator {
    #[must_use]
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        clock: Arc<dyn Clock>,
        identity: Arc<dyn IdentityStore>,
        tokens: Arc<dyn TokenIssuer>,
        audit: Arc<dyn AuditSink>,
        config: AuthConfig,
    ) -> Self {
        Self {
            limiter: LoginAttemptLimiter::new(store.clone(), clock, config.attempts),
            ip_list: IpAccessList::new(store.clone()),
            challenges: ChallengeManager::new(store.clone()),
            devices: DeviceTracker::new(store.clone()),
            store,
            identity,
            tokens,
            audit,
            policy: config.login,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &LoginPolicy {
        &self.policy
    }

    #[must_use]
    pub fn limiter(&self) -> &LoginAttemptLimiter {
        &self.limiter
    }

    #[must_use]
    pub fn ip_list(&self) -> &IpAccessList {
        &self.ip_list
    }

    #[must_use]
    pub fn challenges(&self) -> &ChallengeManager {
        &self.challenges
    }

    #[must_use]
    pub fn devices(&self) -> &DeviceTracker {
        &self.devices
    }

    #[must_use]
    pub fn identity(&self) -> &Arc<dyn IdentityStore> {
        &self.identity
    }

    #[must_use]
    pub fn tokens(&self) -> &Arc<dyn TokenIssuer> {
        &self.tokens
    }

    fn reject(
        &self,
        stage: LoginStage,
        username: &str,
        ctx: &ClientContext,
        rejection: Rejection,
    ) -> LoginOutcome {
        debug!(stage = %stage, code = rejection.code(), "login rejected");
        self.audit.record(&AuditEvent::LoginRejected {
            username: username.to_string(),
            ip: ctx.ip.clone(),
            stage,
            code: rejection.code(),
        });
        LoginOutcome::Rejected(rejection)
    }

    /// Run one login attempt through every check.
    ///
    /// # Errors
    /// Returns an error if the identity store or the token issuer fails.
    #[instrument(skip(self, request, ctx), fields(username = %request.username, ip = %ctx.ip))]
    pub async fn login(
        &self,
        request: &LoginRequest,
        ctx: &ClientContext,
    ) -> Result<LoginOutcome, AuthError> {
        let username = request.username.trim();
        if username.is_empty() || request.password.is_empty() {
            return Ok(self.reject(
                LoginStage::Start,
                username,
                ctx,
                Rejection::bad_request("Username and password are required"),
            ));
        }

        if self.ip_list.is_denylisted(&ctx.ip).await {
            return Ok(self.reject(LoginStage::Start, username, ctx, Rejection::IpBanned));
        }

        let identifier = format!("{}:{username}", ctx.ip);
        if self.limiter.check_lockout(&identifier).await {
            let remaining_seconds = self.limiter.lockout_remaining(&identifier).await;
            return Ok(self.reject(
                LoginStage::IpChecked,
                username,
                ctx,
                Rejection::Locked { remaining_seconds },
            ));
        }

        let remaining_attempts = self.limiter.remaining_attempts(&identifier).await;
        if remaining_attempts <= self.policy.challenge_threshold {
            let solution = request
                .captcha
                .as_deref()
                .map(str::trim)
                .filter(|solution| !solution.is_empty());
            let Some(solution) = solution else {
                return Ok(self.reject(
                    LoginStage::RateChecked,
                    username,
                    ctx,
                    Rejection::ChallengeRequired { remaining_attempts },
                ));
            };
            if !self.challenges.verify(solution, &ctx.ip).await {
                self.limiter.record_failure(&identifier).await;
                let remaining_attempts = self.limiter.remaining_attempts(&identifier).await;
                return Ok(self.reject(
                    LoginStage::RateChecked,
                    username,
                    ctx,
                    Rejection::ChallengeFailed { remaining_attempts },
                ));
            }
        }

        let Some(principal) = self.identity.verify(username, &request.password).await? else {
            let status = self.limiter.record_failure(&identifier).await;
            self.count_address_failure(&ctx.ip).await;
            let remaining_attempts = self.limiter.remaining_attempts(&identifier).await;
            debug!(count = status.count, is_locked = status.is_locked, "credentials rejected");
            return Ok(self.reject(
                LoginStage::ChallengeChecked,
                username,
                ctx,
                Rejection::InvalidCredentials {
                    remaining_attempts,
                    challenge_next: remaining_attempts <= self.policy.challenge_threshold,
                },
            ));
        };

        if !principal.is_active {
            return Ok(self.reject(
                LoginStage::CredentialsChecked,
                username,
                ctx,
                Rejection::AccountDisabled,
            ));
        }

        self.limiter.record_success(&identifier).await;

        let fingerprint = DeviceTracker::fingerprint(ctx);
        let new_device = self.devices.record(principal.id, &fingerprint).await;
        if new_device {
            self.audit.record(&AuditEvent::NewDevice {
                user_id: principal.id,
                ip: ctx.ip.clone(),
                fingerprint,
            });
        }

        let tokens = self.tokens.issue(&principal).await?;

        self.audit.record(&AuditEvent::LoginSucceeded {
            user_id: principal.id,
            username: principal.username.clone(),
            ip: ctx.ip.clone(),
        });
        info!(user_id = principal.id, stage = %LoginStage::Success, "login succeeded");

        Ok(LoginOutcome::Success(Box::new(LoginSuccess::new(
            tokens,
            UserSummary {
                id: principal.id,
                username: principal.username,
            },
            new_device,
        ))))
    }

    /// Count a credential failure against the client address and deny-list it
    /// once the threshold is reached. Allow-listed and unknown addresses are
    /// never banned.
    async fn count_address_failure(&self, ip: &str) {
        if !ClientContext::new(ip).has_known_ip() {
            return;
        }
        let key = format!("{IP_FAILURES_PREFIX}{ip}");
        let window = self.limiter.policy().window();
        let failures = match self.store.incr(&key, Some(window)).await {
            Ok(failures) => failures,
            Err(err) => {
                warn!("Address failure counter unavailable: {err}");
                return;
            }
        };

        if failures < i64::from(self.policy.auto_ban_threshold) {
            return;
        }
        if self.ip_list.is_allowlisted(ip).await {
            debug!(failures, "allow-listed address exempt from auto-ban");
            return;
        }

        if let Err(err) = self
            .ip_list
            .add_to_denylist(ip, Some(self.policy.auto_ban_duration))
            .await
        {
            warn!("Failed to auto-ban address: {err}");
            return;
        }
        if let Err(err) = self.store.delete(&key).await {
            warn!("Failed to reset address failure counter: {err}");
        }
        self.audit.record(&AuditEvent::AutoBanned {
            ip: ip.to_string(),
            failures,
            seconds: self.policy.auto_ban_duration.as_secs(),
        });
    }

    /// Issue a challenge bound to the client address.
    ///
    /// # Errors
    /// Returns an error if the challenge cannot be stored.
    #[instrument(skip(self, ctx), fields(ip = %ctx.ip))]
    pub async fn challenge(&self, ctx: &ClientContext) -> Result<Challenge, StoreError> {
        self.challenges.issue(&ctx.ip).await
    }

    /// Create an account and log it in.
    ///
    /// # Errors
    /// Returns an error if the identity store or the token issuer fails.
    #[instrument(skip(self, request, ctx), fields(username = %request.username, ip = %ctx.ip))]
    pub async fn register(
        &self,
        request: &RegisterRequest,
        ctx: &ClientContext,
    ) -> Result<LoginOutcome, AuthError> {
        let username = request.username.trim();

        if self.ip_list.is_denylisted(&ctx.ip).await {
            debug!("registration from banned address");
            return Ok(LoginOutcome::Rejected(Rejection::IpBanned));
        }
        if let Err(reason) = validate_username(username) {
            return Ok(LoginOutcome::Rejected(Rejection::bad_request(reason)));
        }
        if let Err(reason) = validate_password(&request.password) {
            return Ok(LoginOutcome::Rejected(Rejection::bad_request(reason)));
        }
        if request.password != request.password_confirm {
            return Ok(LoginOutcome::Rejected(Rejection::bad_request(
                "Passwords do not match",
            )));
        }
        if self.identity.exists(username).await? {
            return Ok(LoginOutcome::Rejected(Rejection::UsernameTaken));
        }

        let principal = match self.identity.register(username, &request.password).await {
            Ok(principal) => principal,
            Err(IdentityError::UsernameTaken(_)) => {
                return Ok(LoginOutcome::Rejected(Rejection::UsernameTaken));
            }
            Err(err) => return Err(err.into()),
        };

        let fingerprint = DeviceTracker::fingerprint(ctx);
        let new_device = self.devices.record(principal.id, &fingerprint).await;
        let tokens = self.tokens.issue(&principal).await?;

        self.audit.record(&AuditEvent::Registered {
            user_id: principal.id,
            username: principal.username.clone(),
            ip: ctx.ip.clone(),
        });

        Ok(LoginOutcome::Success(Box::new(LoginSuccess::new(
            tokens,
            UserSummary {
                id: principal.id,
                username: principal.username,
            },
            new_device,
        ))))
    }

    /// Trade a refresh token for a new pair. The presented token is revoked.
    ///
    /// # Errors
    /// Returns an error if the token is invalid or revoked, the account is gone
    /// or disabled, or a collaborator fails.
    #[instrument(skip(self, refresh_token))]
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let claims = self.tokens.verify(refresh_token, TokenKind::Refresh).await?;
        let user_id = claims.user_id()?;
        let principal = self
            .identity
            .find(user_id)
            .await?
            .filter(|principal| principal.is_active)
            .ok_or(TokenError::InactiveSubject)?;

        self.tokens.revoke(&claims).await?;
        let pair = self.tokens.issue(&principal).await?;
        self.audit.record(&AuditEvent::TokenRefreshed { user_id });
        Ok(pair)
    }

    /// Revoke a refresh token.
    ///
    /// # Errors
    /// Returns an error if the token is invalid or cannot be revoked.
    #[instrument(skip(self, refresh_token))]
    pub async fn logout(&self, refresh_token: &str) -> Result<(), AuthError> {
        let claims = self.tokens.verify(refresh_token, TokenKind::Refresh).await?;
        let user_id = claims.user_id()?;
        self.tokens.revoke(&claims).await?;
        self.audit.record(&AuditEvent::LoggedOut { user_id });
        Ok(())
    }
}
