use clap::{builder::ValueParser, Arg, ArgAction, ArgMatches, Command};
use tracing_subscriber::filter::Directive;

pub const ARG_VERBOSITY: &str = "verbosity";
pub const ARG_LOG_FILTER: &str = "log-filter";

/// Accepts a level name or a count from 0 (error) to 4 (trace).
#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::from(|level: &str| -> Result<u8, String> {
        let count = match level.to_lowercase().as_str() {
            "error" => 0,
            "warn" => 1,
            "info" => 2,
            "debug" => 3,
            "trace" => 4,
            other => other
                .parse::<u8>()
                .ok()
                .filter(|count| *count <= 4)
                .ok_or_else(|| format!("invalid log level: {level}"))?,
        };
        Ok(count)
    })
}

/// One `target=level` directive, e.g. `audit=info` or `bastion::rbac=trace`.
#[must_use]
pub fn validator_filter_directive() -> ValueParser {
    ValueParser::from(|directive: &str| -> Result<Directive, String> {
        directive
            .trim()
            .parse::<Directive>()
            .map_err(|err| format!("invalid filter directive {directive}: {err}"))
    })
}

/// Extra filter directives, applied on top of the verbosity level.
#[must_use]
pub fn directives(matches: &ArgMatches) -> Vec<Directive> {
    matches
        .get_many::<Directive>(ARG_LOG_FILTER)
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_VERBOSITY)
                .short('v')
                .long("verbose")
                .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
                .env("BASTION_LOG_LEVEL")
                .global(true)
                .action(ArgAction::Count)
                .value_parser(validator_log_level()),
        )
        .arg(
            Arg::new(ARG_LOG_FILTER)
                .long(ARG_LOG_FILTER)
                .help("Comma separated per-target levels, e.g. audit=info,bastion::security=debug")
                .env("BASTION_LOG_FILTER")
                .global(true)
                .value_delimiter(',')
                .action(ArgAction::Append)
                .value_parser(validator_filter_directive()),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> Command {
        with_args(Command::new("bastion"))
    }

    #[test]
    fn test_filter_directives() {
        temp_env::with_vars([("BASTION_LOG_FILTER", None::<&str>)], || {
            let matches = command().get_matches_from(vec![
                "bastion",
                "--log-filter",
                "audit=info,bastion::security=debug",
            ]);
            let rendered: Vec<String> = directives(&matches)
                .iter()
                .map(ToString::to_string)
                .collect();
            assert_eq!(rendered, vec!["audit=info", "bastion::security=debug"]);
        });
    }

    #[test]
    fn test_filter_directives_from_env() {
        temp_env::with_vars([("BASTION_LOG_FILTER", Some("audit=warn"))], || {
            let matches = command().get_matches_from(vec!["bastion"]);
            assert_eq!(directives(&matches).len(), 1);
        });
    }

    #[test]
    fn test_no_filter_directives() {
        temp_env::with_vars([("BASTION_LOG_FILTER", None::<&str>)], || {
            let matches = command().get_matches_from(vec!["bastion"]);
            assert!(directives(&matches).is_empty());
        });
    }

    #[test]
    fn test_invalid_filter_directive() {
        temp_env::with_vars([("BASTION_LOG_FILTER", None::<&str>)], || {
            let result =
                command().try_get_matches_from(vec!["bastion", "--log-filter", "audit=loud"]);
            assert!(result.is_err());
        });
    }

    #[test]
    fn test_log_level_names_and_counts() {
        let cmd = Command::new("bastion").arg(
            Arg::new("level")
                .long("level")
                .value_parser(validator_log_level()),
        );
        for (input, expected) in [("error", 0_u8), ("WARN", 1), ("3", 3), ("trace", 4)] {
            let matches = cmd
                .clone()
                .try_get_matches_from(vec!["bastion", "--level", input]);
            let parsed = matches
                .ok()
                .and_then(|m| m.get_one::<u8>("level").copied());
            assert_eq!(parsed, Some(expected), "{input}");
        }
        assert!(cmd
            .try_get_matches_from(vec!["bastion", "--level", "9"])
            .is_err());
    }
}
