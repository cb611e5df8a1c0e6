use crate::{
    api::{self, ServerConfig},
    auth::{AuthConfig, LoginPolicy, TokenConfig},
    security::AttemptPolicy,
};
use anyhow::Result;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: SecretString,
    pub seed_rbac: bool,
    pub max_attempts: u32,
    pub lockout_seconds: u64,
    pub window_seconds: u64,
    pub challenge_threshold: u32,
    pub auto_ban_threshold: u32,
    pub auto_ban_seconds: u64,
    pub jwt_secret: SecretString,
    pub jwt_issuer: String,
    pub access_ttl_seconds: u64,
    pub refresh_ttl_seconds: u64,
}

impl Args {
    #[must_use]
    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            attempts: AttemptPolicy::new()
                .with_max_attempts(self.max_attempts)
                .with_lockout(Duration::from_secs(self.lockout_seconds))
                .with_window(Duration::from_secs(self.window_seconds)),
            login: LoginPolicy::new()
                .with_challenge_threshold(self.challenge_threshold)
                .with_auto_ban_threshold(self.auto_ban_threshold)
                .with_auto_ban_duration(Duration::from_secs(self.auto_ban_seconds)),
        }
    }

    #[must_use]
    pub fn token_config(&self) -> TokenConfig {
        TokenConfig::new(self.jwt_secret.clone())
            .with_issuer(self.jwt_issuer.clone())
            .with_access_ttl(Duration::from_secs(self.access_ttl_seconds))
            .with_refresh_ttl(Duration::from_secs(self.refresh_ttl_seconds))
    }
}

/// Run the HTTP server until shutdown.
///
/// # Errors
/// Returns an error if the database is unreachable or the listener cannot bind.
pub async fn execute(args: Args) -> Result<()> {
    let config = ServerConfig {
        dsn: args.dsn.expose_secret().to_string(),
        tokens: args.token_config(),
        auth: args.auth_config(),
        seed_rbac: args.seed_rbac,
    };

    api::new(args.port, config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> Args {
        Args {
            port: 8080,
            dsn: SecretString::from("postgres://bastion:pw@localhost/bastion".to_string()),
            seed_rbac: false,
            max_attempts: 3,
            lockout_seconds: 60,
            window_seconds: 120,
            challenge_threshold: 1,
            auto_ban_threshold: 4,
            auto_ban_seconds: 30,
            jwt_secret: SecretString::from("s3cret".to_string()),
            jwt_issuer: "issuer".to_string(),
            access_ttl_seconds: 10,
            refresh_ttl_seconds: 20,
        }
    }

    #[test]
    fn test_auth_config() {
        let config = args().auth_config();
        assert_eq!(config.attempts.max_attempts(), 3);
        assert_eq!(config.attempts.lockout(), Duration::from_secs(60));
        assert_eq!(config.attempts.window(), Duration::from_secs(120));
        assert_eq!(config.login.challenge_threshold(), 1);
        assert_eq!(config.login.auto_ban_threshold(), 4);
        assert_eq!(config.login.auto_ban_duration(), Duration::from_secs(30));
    }

    #[test]
    fn test_token_config() {
        let config = args().token_config();
        assert_eq!(config.issuer(), "issuer");
        assert_eq!(config.access_ttl(), Duration::from_secs(10));
        assert_eq!(config.refresh_ttl(), Duration::from_secs(20));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let debug = format!("{:?}", args());
        assert!(!debug.contains("s3cret"));
        assert!(!debug.contains(":pw@"));
    }
}
