pub mod auth;
pub mod logging;
pub mod vault;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Arg, ColorChoice, Command,
};

use self::vault::{ARG_VAULT_ROLE_ID, ARG_VAULT_SECRET_ID, ARG_VAULT_URL, ARG_VAULT_WRAPPED_TOKEN};

pub const ARG_TOKEN_SECRET: &str = "token-secret";

/// Either a literal token secret or a complete Vault login must be given.
///
/// # Errors
/// Returns an error string naming the missing argument.
pub fn validate(matches: &clap::ArgMatches) -> Result<(), String> {
    if !matches.contains_id(ARG_VAULT_URL) {
        if matches.contains_id(ARG_TOKEN_SECRET) {
            return Ok(());
        }
        return Err(format!(
            "Missing required argument: --{ARG_TOKEN_SECRET} or --{ARG_VAULT_URL}"
        ));
    }

    if !matches.contains_id(ARG_VAULT_ROLE_ID) {
        return Err(format!(
            "Missing required argument: --{ARG_VAULT_ROLE_ID} (required with --{ARG_VAULT_URL})"
        ));
    }
    if !matches.contains_id(ARG_VAULT_SECRET_ID) && !matches.contains_id(ARG_VAULT_WRAPPED_TOKEN) {
        return Err(format!(
            "Missing required argument: --{ARG_VAULT_SECRET_ID} or --{ARG_VAULT_WRAPPED_TOKEN}"
        ));
    }
    Ok(())
}

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!(
            "{} - {}",
            env!("CARGO_PKG_VERSION"),
            crate::portier::GIT_COMMIT_HASH
        )
        .into_boxed_str(),
    );

    let command = Command::new("portier")
        .about("Authentication and session security core")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("8080")
                .env("PORTIER_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("dsn")
                .short('d')
                .long("dsn")
                .help("Database connection string for the shared store and user directory")
                .env("PORTIER_DSN")
                .required(true),
        )
        .arg(
            Arg::new(ARG_TOKEN_SECRET)
                .long(ARG_TOKEN_SECRET)
                .help("Token signing secret, at least 32 bytes (ignored when --vault-url is set)")
                .env("PORTIER_TOKEN_SECRET")
                .hide_env_values(true),
        );

    let command = vault::with_args(command);
    let command = auth::with_args(command);
    logging::with_args(command)
}
