use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_JWT_SECRET: &str = "jwt-secret";
pub const ARG_JWT_ISSUER: &str = "jwt-issuer";
pub const ARG_ACCESS_TTL: &str = "access-token-ttl";
pub const ARG_REFRESH_TTL: &str = "refresh-token-ttl";

#[derive(Debug, Clone)]
pub struct Options {
    pub secret: SecretString,
    pub issuer: String,
    pub access_ttl_seconds: u64,
    pub refresh_ttl_seconds: u64,
}

impl Options {
    /// # Errors
    /// Returns an error if the signing secret or a lifetime is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let secret = matches
            .get_one::<String>(ARG_JWT_SECRET)
            .cloned()
            .map(SecretString::from)
            .context("missing required argument: --jwt-secret")?;

        Ok(Self {
            secret,
            issuer: matches
                .get_one::<String>(ARG_JWT_ISSUER)
                .cloned()
                .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
            access_ttl_seconds: matches
                .get_one::<u64>(ARG_ACCESS_TTL)
                .copied()
                .context("missing required argument: --access-token-ttl")?,
            refresh_ttl_seconds: matches
                .get_one::<u64>(ARG_REFRESH_TTL)
                .copied()
                .context("missing required argument: --refresh-token-ttl")?,
        })
    }
}

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_JWT_SECRET)
                .long(ARG_JWT_SECRET)
                .help("HMAC secret used to sign access and refresh tokens")
                .env("BASTION_JWT_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_JWT_ISSUER)
                .long(ARG_JWT_ISSUER)
                .help("Issuer claim stamped on and required from tokens")
                .env("BASTION_JWT_ISSUER")
                .default_value("bastion"),
        )
        .arg(
            Arg::new(ARG_ACCESS_TTL)
                .long(ARG_ACCESS_TTL)
                .help("Access token lifetime in seconds")
                .env("BASTION_ACCESS_TOKEN_TTL")
                .default_value("900")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TTL)
                .long(ARG_REFRESH_TTL)
                .help("Refresh token lifetime in seconds")
                .env("BASTION_REFRESH_TOKEN_TTL")
                .default_value("604800")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
