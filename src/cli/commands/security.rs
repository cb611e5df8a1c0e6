use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};

pub const ARG_MAX_ATTEMPTS: &str = "login-max-attempts";
pub const ARG_LOCKOUT_SECONDS: &str = "login-lockout-seconds";
pub const ARG_WINDOW_SECONDS: &str = "login-window-seconds";
pub const ARG_CHALLENGE_THRESHOLD: &str = "challenge-threshold";
pub const ARG_AUTO_BAN_THRESHOLD: &str = "auto-ban-threshold";
pub const ARG_AUTO_BAN_SECONDS: &str = "auto-ban-seconds";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub max_attempts: u32,
    pub lockout_seconds: u64,
    pub window_seconds: u64,
    pub challenge_threshold: u32,
    pub auto_ban_threshold: u32,
    pub auto_ban_seconds: u64,
}

impl Options {
    /// # Errors
    /// Returns an error if a login-security argument is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let u32_arg = |name: &str| -> Result<u32> {
            matches
                .get_one::<u32>(name)
                .copied()
                .with_context(|| format!("missing required argument: --{name}"))
        };
        let u64_arg = |name: &str| -> Result<u64> {
            matches
                .get_one::<u64>(name)
                .copied()
                .with_context(|| format!("missing required argument: --{name}"))
        };

        Ok(Self {
            max_attempts: u32_arg(ARG_MAX_ATTEMPTS)?,
            lockout_seconds: u64_arg(ARG_LOCKOUT_SECONDS)?,
            window_seconds: u64_arg(ARG_WINDOW_SECONDS)?,
            challenge_threshold: u32_arg(ARG_CHALLENGE_THRESHOLD)?,
            auto_ban_threshold: u32_arg(ARG_AUTO_BAN_THRESHOLD)?,
            auto_ban_seconds: u64_arg(ARG_AUTO_BAN_SECONDS)?,
        })
    }
}

pub fn with_args(command: Command) -> Command {
    let command = with_limiter_args(command);
    with_escalation_args(command)
}

fn with_limiter_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_MAX_ATTEMPTS)
                .long(ARG_MAX_ATTEMPTS)
                .help("Failed logins allowed per ip:username inside the window")
                .env("BASTION_LOGIN_MAX_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_SECONDS)
                .long(ARG_LOCKOUT_SECONDS)
                .help("Lockout duration in seconds once the limit is reached")
                .env("BASTION_LOGIN_LOCKOUT_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_WINDOW_SECONDS)
                .long(ARG_WINDOW_SECONDS)
                .help("Window in seconds over which failures are counted")
                .env("BASTION_LOGIN_WINDOW_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64)),
        )
}

fn with_escalation_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_CHALLENGE_THRESHOLD)
                .long(ARG_CHALLENGE_THRESHOLD)
                .help("Remaining attempts at or below which a challenge is required")
                .env("BASTION_CHALLENGE_THRESHOLD")
                .default_value("2")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_AUTO_BAN_THRESHOLD)
                .long(ARG_AUTO_BAN_THRESHOLD)
                .help("Credential failures from one IP before it is deny-listed")
                .env("BASTION_AUTO_BAN_THRESHOLD")
                .default_value("10")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_AUTO_BAN_SECONDS)
                .long(ARG_AUTO_BAN_SECONDS)
                .help("How long an auto-banned IP stays deny-listed, in seconds")
                .env("BASTION_AUTO_BAN_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64)),
        )
}
