//! Login, registration and session tokens.
//!
//! [`Authenticator`] drives a login through the checks in
//! [`crate::security`] and only then asks the [`IdentityStore`] and the
//! [`TokenIssuer`] for credentials and tokens. Rejections are returned as
//! [`Rejection`] values; collaborator failures surface as [`AuthError`].

pub mod audit;
pub mod identity;
pub mod orchestrator;
pub mod token;
pub mod types;

pub use audit::{AuditEvent, AuditSink, RecordingAuditSink, TracingAuditSink};
pub use identity::{IdentityError, IdentityStore, MemoryIdentityStore, PgIdentityStore, Principal};
pub use orchestrator::{AuthConfig, Authenticator, LoginPolicy};
pub use token::{Claims, JwtIssuer, TokenConfig, TokenError, TokenIssuer, TokenKind, TokenPair};
pub use types::{
    ErrorKind, LoginOutcome, LoginRequest, LoginStage, LoginSuccess, RegisterRequest, Rejection,
    UserSummary,
};

/// Failures the login path does not turn into a [`Rejection`].
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Token(#[from] TokenError),
}
