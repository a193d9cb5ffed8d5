use crate::{auth::token::MIN_SECRET_LEN, cli::globals::GlobalArgs, vault};
use anyhow::{anyhow, Context, Result};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{info_span, instrument, Instrument};

const TOKEN_SECRET_FIELD: &str = "token_secret";

/// Read the token signing secret from a KV v2 mount.
///
/// # Errors
/// Returns an error if the Vault request fails, the field is missing, or the
/// secret is too short to sign tokens with.
#[instrument(skip(globals))]
pub async fn read_token_secret(
    globals: &GlobalArgs,
    kv_mount: &str,
    kv_path: &str,
) -> Result<SecretString> {
    let path = format!("/v1/{kv_mount}/data/{kv_path}");
    let url = vault::endpoint_url(&globals.vault_url, &path)?;

    let span = info_span!(
        "vault.kv.read",
        http.method = "GET",
        url = %url
    );
    let response = vault::client()?
        .get(&url)
        .header("X-Vault-Token", globals.vault_token.expose_secret())
        .send()
        .instrument(span)
        .await?;

    let json = vault::error_for_status(&url, response).await?;
    secret_from_response(&json)
}

fn secret_from_response(json: &Value) -> Result<SecretString> {
    let secret = json
        .get("data")
        .and_then(|data| data.get("data"))
        .and_then(|data| data.get(TOKEN_SECRET_FIELD))
        .and_then(Value::as_str)
        .context("token secret missing from vault response")?;

    if secret.len() < MIN_SECRET_LEN {
        return Err(anyhow!(
            "token secret length is {}, expected at least {MIN_SECRET_LEN}",
            secret.len()
        ));
    }

    Ok(SecretString::from(secret))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_secret_from_kv_v2_envelope() -> Result<()> {
        let response = json!({
            "data": {
                "data": { "token_secret": "0123456789abcdef0123456789abcdef" },
                "metadata": { "version": 3 }
            }
        });
        let secret = secret_from_response(&response)?;
        assert_eq!(secret.expose_secret(), "0123456789abcdef0123456789abcdef");
        Ok(())
    }

    #[test]
    fn missing_or_short_secrets_fail() {
        assert!(secret_from_response(&json!({ "data": { "data": {} } })).is_err());
        assert!(secret_from_response(&json!({ "data": { "data": { "token_secret": "short" } } })).is_err());
    }
}
