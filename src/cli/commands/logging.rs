use clap::{builder::ValueParser, Arg, Command};

pub const ARG_VERBOSITY: &str = "verbosity";

fn parse_log_level(level: &str) -> std::result::Result<u8, String> {
    if let Ok(parsed) = level.parse::<u8>() {
        // Successfully parsed as a number
        if parsed <= 5 {
            return Ok(parsed);
        }
    }

    match level.to_lowercase().as_str() {
        "error" => Ok(0),
        "warn" => Ok(1),
        "info" => Ok(2),
        "debug" => Ok(3),
        "trace" => Ok(4),
        _ => Err("invalid log level".to_string()),
    }
}

#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::from(parse_log_level)
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_VERBOSITY)
            .short('v')
            .long("verbose")
            .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
            .env("PORTIER_LOG_LEVEL")
            .global(true)
            .action(clap::ArgAction::Count)
            .value_parser(validator_log_level()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parser() {
        for (input, expected) in [("error", 0u8), ("WARN", 1), ("trace", 4), ("5", 5)] {
            assert_eq!(parse_log_level(input), Ok(expected), "{input}");
        }
        assert!(parse_log_level("loud").is_err());
        assert!(parse_log_level("9").is_err());
    }

    #[test]
    fn test_verbosity_count() {
        temp_env::with_vars_unset(["PORTIER_LOG_LEVEL"], || {
            let matches = crate::cli::commands::new().get_matches_from(vec![
                "portier",
                "--dsn",
                "postgres://localhost/portier",
                "-vv",
            ]);
            assert_eq!(matches.get_one::<u8>(ARG_VERBOSITY).copied(), Some(2));
        });
    }
}
