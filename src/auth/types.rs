use super::token::TokenPair;
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

#[derive(Clone, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    /// Challenge solution, required once few attempts remain.
    #[serde(default)]
    pub captcha: Option<String>,
}

impl LoginRequest {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            captcha: None,
        }
    }

    #[must_use]
    pub fn with_captcha(mut self, captcha: impl Into<String>) -> Self {
        self.captcha = Some(captcha.into());
        self
    }
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"***")
            .field("captcha", &self.captcha.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Clone, Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub password_confirm: String,
}

impl RegisterRequest {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        let password = password.into();
        Self {
            username: username.into(),
            password_confirm: password.clone(),
            password,
        }
    }
}

impl fmt::Debug for RegisterRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterRequest")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Where the login state machine was when it stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoginStage {
    Start,
    IpChecked,
    RateChecked,
    ChallengeChecked,
    CredentialsChecked,
    Success,
}

impl LoginStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::IpChecked => "ip_checked",
            Self::RateChecked => "rate_checked",
            Self::ChallengeChecked => "challenge_checked",
            Self::CredentialsChecked => "credentials_checked",
            Self::Success => "success",
        }
    }
}

impl fmt::Display for LoginStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    ValidationFailure,
    AuthorizationDenied,
    CredentialMismatch,
}

/// Terminal outcome of a refused login or registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    BadRequest { message: String },
    IpBanned,
    Locked { remaining_seconds: u64 },
    ChallengeRequired { remaining_attempts: u32 },
    ChallengeFailed { remaining_attempts: u32 },
    InvalidCredentials { remaining_attempts: u32, challenge_next: bool },
    AccountDisabled,
    UsernameTaken,
}

impl Rejection {
    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "bad_request",
            Self::IpBanned => "ip_banned",
            Self::Locked { .. } => "locked",
            Self::ChallengeRequired { .. } => "challenge_required",
            Self::ChallengeFailed { .. } => "invalid_credentials_or_challenge",
            Self::InvalidCredentials { .. } => "invalid_credentials",
            Self::AccountDisabled => "account_disabled",
            Self::UsernameTaken => "username_taken",
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest { .. } | Self::ChallengeRequired { .. } | Self::UsernameTaken => {
                ErrorKind::ValidationFailure
            }
            Self::IpBanned | Self::Locked { .. } | Self::AccountDisabled => {
                ErrorKind::AuthorizationDenied
            }
            Self::ChallengeFailed { .. } | Self::InvalidCredentials { .. } => {
                ErrorKind::CredentialMismatch
            }
        }
    }

    /// User-facing text. Never says whether the username exists.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::BadRequest { message } => message.clone(),
            Self::IpBanned => "Access from this IP address has been blocked".to_string(),
            Self::Locked { remaining_seconds } => {
                let minutes = remaining_seconds.div_ceil(60).max(1);
                format!("Too many failed login attempts, try again in {minutes} minute(s)")
            }
            Self::ChallengeRequired { remaining_attempts } => format!(
                "Too many failed login attempts, a verification code is required \
                 ({remaining_attempts} attempt(s) remaining)"
            ),
            Self::ChallengeFailed { remaining_attempts } => format!(
                "Invalid credentials or verification code ({remaining_attempts} attempt(s) remaining)"
            ),
            Self::InvalidCredentials {
                remaining_attempts,
                challenge_next,
            } => {
                let mut message = format!(
                    "Invalid username or password ({remaining_attempts} attempt(s) remaining)"
                );
                if *challenge_next {
                    message.push_str(", a verification code will be required");
                }
                message
            }
            Self::AccountDisabled => "This account has been disabled".to_string(),
            Self::UsernameTaken => "Username is already taken".to_string(),
        }
    }

    #[must_use]
    pub fn remaining_attempts(&self) -> Option<u32> {
        match self {
            Self::ChallengeRequired { remaining_attempts }
            | Self::ChallengeFailed { remaining_attempts }
            | Self::InvalidCredentials {
                remaining_attempts, ..
            } => Some(*remaining_attempts),
            _ => None,
        }
    }

    #[must_use]
    pub fn remaining_seconds(&self) -> Option<u64> {
        match self {
            Self::Locked { remaining_seconds } => Some(*remaining_seconds),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct UserSummary {
    pub id: i64,
    pub username: String,
}

#[derive(Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct LoginSuccess {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
    pub user: UserSummary,
    /// First login from this device fingerprint.
    pub new_device: bool,
}

impl LoginSuccess {
    pub(crate) fn new(tokens: TokenPair, user: UserSummary, new_device: bool) -> Self {
        Self {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            token_type: tokens.token_type,
            expires_in: tokens.expires_in,
            user,
            new_device,
        }
    }
}

impl fmt::Debug for LoginSuccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginSuccess")
            .field("user", &self.user)
            .field("new_device", &self.new_device)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoginOutcome {
    Success(Box<LoginSuccess>),
    Rejected(Rejection),
}

impl LoginOutcome {
    #[must_use]
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Rejected(rejection) => Some(rejection),
            Self::Success(_) => None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}
