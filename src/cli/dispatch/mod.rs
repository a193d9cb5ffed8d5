//! Maps validated CLI matches to the action the binary runs.

use crate::cli::actions::{
    server::{Args, VaultArgs},
    Action,
};
use crate::cli::commands::{auth, vault, ARG_TOKEN_SECRET};
use anyhow::{Context, Result};
use secrecy::SecretString;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;

    crate::cli::commands::validate(matches).map_err(|e| anyhow::anyhow!(e))?;

    let vault = vault::Options::parse(matches)?.map(|opts| VaultArgs {
        url: opts.url,
        role_id: opts.role_id,
        secret_id: opts.secret_id,
        wrapped_token: opts.wrapped_token,
        kv_mount: opts.kv_mount,
        kv_path: opts.kv_path,
    });

    let token_secret = matches
        .get_one::<String>(ARG_TOKEN_SECRET)
        .map(|secret| SecretString::from(secret.as_str()));

    let auth = auth::Options::parse(matches)?.into_config()?;

    Ok(Action::Server(Args {
        port,
        dsn,
        token_secret,
        vault,
        auth,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_from_env() {
        temp_env::with_vars(
            [
                ("PORTIER_DSN", Some("postgres://localhost:5432/portier")),
                ("PORTIER_TOKEN_SECRET", Some("0123456789abcdef0123456789abcdef")),
                ("PORTIER_VAULT_URL", None),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["portier"]);
                let result = handler(&matches);
                assert!(result.is_ok());
                if let Ok(Action::Server(args)) = result {
                    assert_eq!(args.port, 8080);
                    assert!(args.token_secret.is_some());
                    assert!(args.vault.is_none());
                    assert!(!format!("{:?}", args.token_secret).contains("0123456789"));
                }
            },
        );
    }

    #[test]
    fn test_missing_secret() {
        temp_env::with_vars(
            [
                ("PORTIER_DSN", Some("postgres://localhost:5432/portier")),
                ("PORTIER_TOKEN_SECRET", None),
                ("PORTIER_VAULT_URL", None),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["portier"]);
                let result = handler(&matches);
                assert!(result.is_err());
                if let Err(err) = result {
                    assert!(err.to_string().contains("--token-secret"));
                }
            },
        );
    }

    #[test]
    fn test_vault_args() {
        temp_env::with_vars(
            [
                ("PORTIER_DSN", Some("postgres://localhost:5432/portier")),
                (
                    "PORTIER_VAULT_URL",
                    Some("http://127.0.0.1:8200/v1/auth/approle/login"),
                ),
                ("PORTIER_VAULT_ROLE_ID", Some("role-id")),
                ("PORTIER_VAULT_SECRET_ID", Some("secret-id")),
                ("PORTIER_VAULT_WRAPPED_TOKEN", None),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["portier"]);
                let result = handler(&matches);
                assert!(result.is_ok());
                if let Ok(Action::Server(args)) = result {
                    let vault = args.vault.as_ref();
                    assert_eq!(vault.map(|v| v.role_id.as_str()), Some("role-id"));
                    assert_eq!(vault.map(|v| v.kv_path.as_str()), Some("config"));
                }
            },
        );
    }
}
