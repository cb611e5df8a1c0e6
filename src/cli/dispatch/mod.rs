//! Maps validated CLI arguments to the action the binary runs.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{security, token, ARG_DSN, ARG_PORT, ARG_SEED_RBAC};
use anyhow::{Context, Result};
use secrecy::SecretString;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .cloned()
        .map(SecretString::from)
        .context("missing required argument: --dsn")?;

    let security_opts = security::Options::parse(matches)?;
    let token_opts = token::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        seed_rbac: matches.get_flag(ARG_SEED_RBAC),
        max_attempts: security_opts.max_attempts,
        lockout_seconds: security_opts.lockout_seconds,
        window_seconds: security_opts.window_seconds,
        challenge_threshold: security_opts.challenge_threshold,
        auto_ban_threshold: security_opts.auto_ban_threshold,
        auto_ban_seconds: security_opts.auto_ban_seconds,
        jwt_secret: token_opts.secret,
        jwt_issuer: token_opts.issuer,
        access_ttl_seconds: token_opts.access_ttl_seconds,
        refresh_ttl_seconds: token_opts.refresh_ttl_seconds,
    }))
}
