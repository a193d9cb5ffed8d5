//! Minimal Vault client: `AppRole` login, response unwrapping, KV reads and
//! token renewal.

pub mod kv;
pub mod renew;

use crate::portier::APP_USER_AGENT;
use anyhow::{anyhow, Result};
use reqwest::{Client, Response};
use serde_json::{json, Value};
use tracing::{debug, instrument};
use url::Url;

/// Join `endpoint` onto the scheme, host and port of `vault_url`.
///
/// # Errors
/// Returns an error if `vault_url` cannot be parsed, has no host, or uses an
/// unsupported scheme.
#[instrument]
pub fn endpoint_url(vault_url: &str, endpoint: &str) -> Result<String> {
    let url = Url::parse(vault_url)?;

    let scheme = url.scheme();

    let host = url
        .host()
        .ok_or_else(|| anyhow!("Error parsing URL: no host specified"))?
        .to_owned();

    let port = match url.port() {
        Some(p) => p,
        None => match scheme {
            "http" => 80,
            "https" => 443,
            _ => return Err(anyhow!("Error parsing URL: unsupported scheme {scheme}")),
        },
    };

    let endpoint_url = format!("{scheme}://{host}:{port}{endpoint}");

    debug!("endpoint URL: {endpoint_url}");

    Ok(endpoint_url)
}

pub(crate) fn client() -> Result<Client> {
    Ok(Client::builder().user_agent(APP_USER_AGENT).build()?)
}

/// Turn a non-success Vault response into an error carrying its first message.
pub(crate) async fn error_for_status(url: &str, response: Response) -> Result<Value> {
    let status = response.status();
    let json_response: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        return Err(anyhow!(
            "{} - {}, {}",
            url,
            status,
            json_response["errors"][0].as_str().unwrap_or("")
        ));
    }
    Ok(json_response)
}

/// Unwrap a wrapped `AppRole` secret id.
/// Create wrapped token with:
/// vault write -wrap-ttl=300s -f auth/approle/role/portier/secret-id
///
/// # Errors
/// Returns an error if the request fails or the response has no `secret_id`.
#[instrument(skip(token))]
pub async fn unwrap(vault_url: &str, token: &str) -> Result<String> {
    let unwrap_url = endpoint_url(vault_url, "/v1/sys/wrapping/unwrap")?;

    let response = client()?
        .post(&unwrap_url)
        .header("X-Vault-Token", token)
        .send()
        .await?;

    let json_response = error_for_status(&unwrap_url, response).await?;
    let sid = json_response["data"]["secret_id"]
        .as_str()
        .ok_or_else(|| anyhow!("Error parsing JSON response: no secret_id found"))?;

    Ok(sid.to_string())
}

/// Login to Vault using `AppRole`; returns the client token and its lease in seconds.
/// Create a secret ID with:
/// vault write -f auth/approle/role/portier/secret-id
///
/// # Errors
/// Returns an error if the request fails or the response has no `client_token`.
#[instrument(skip(sid))]
pub async fn approle_login(vault_url: &str, sid: &str, rid: &str) -> Result<(String, u64)> {
    let login_payload = json!({
        "role_id": rid,
        "secret_id": sid
    });

    debug!("login URL: {vault_url}, role ID: {rid}");

    let response = client()?.post(vault_url).json(&login_payload).send().await?;

    let json_response = error_for_status(vault_url, response).await?;
    let token = json_response["auth"]["client_token"]
        .as_str()
        .ok_or_else(|| anyhow!("Error parsing JSON response: no client_token found"))?;
    let lease_duration = json_response["auth"]["lease_duration"]
        .as_u64()
        .unwrap_or(1800);

    Ok((token.to_string(), lease_duration))
}
