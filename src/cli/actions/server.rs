use crate::{
    auth::AuthConfig,
    cli::globals::GlobalArgs,
    portier::{self, VaultLease},
    vault,
};
use anyhow::{anyhow, Context, Result};
use secrecy::SecretString;
use tracing::debug;

#[derive(Debug)]
pub struct VaultArgs {
    pub url: String,
    pub role_id: String,
    pub secret_id: Option<String>,
    pub wrapped_token: Option<String>,
    pub kv_mount: String,
    pub kv_path: String,
}

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub token_secret: Option<SecretString>,
    pub vault: Option<VaultArgs>,
    pub auth: AuthConfig,
}

/// Log in to Vault and read the token secret from KV.
async fn secret_from_vault(args: &VaultArgs) -> Result<(SecretString, VaultLease)> {
    let mut globals = GlobalArgs::new(args.url.clone());

    // If vault wrapped token try to unwrap, otherwise use secret-id.
    let (vault_token, lease_duration) = if let Some(wrapped) = &args.wrapped_token {
        let secret_id = vault::unwrap(&globals.vault_url, wrapped).await?;
        vault::approle_login(&globals.vault_url, &secret_id, &args.role_id).await?
    } else {
        let secret_id = args
            .secret_id
            .as_deref()
            .ok_or_else(|| anyhow!("Vault secret-id is required"))?;
        vault::approle_login(&globals.vault_url, secret_id, &args.role_id).await?
    };

    globals.set_token(SecretString::from(vault_token));

    debug!("Global args: {:?}", globals);

    let secret = vault::kv::read_token_secret(&globals, &args.kv_mount, &args.kv_path)
        .await
        .context("Could not read token secret from Vault")?;

    Ok((
        secret,
        VaultLease {
            globals,
            lease_duration,
        },
    ))
}

/// Execute the server action.
/// # Errors
/// Returns an error if no token secret is available, Vault login fails, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let (token_secret, lease) = match (&args.vault, args.token_secret) {
        (Some(vault_args), _) => {
            let (secret, lease) = secret_from_vault(vault_args).await?;
            (secret, Some(lease))
        }
        (None, Some(secret)) => (secret, None),
        (None, None) => return Err(anyhow!("a token secret or Vault configuration is required")),
    };

    portier::new(args.port, args.dsn, args.auth, token_secret, lease).await
}
