use crate::{cli::globals::GlobalArgs, vault};
use anyhow::{anyhow, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tokio::{
    sync::mpsc,
    time::{sleep, Duration},
};
use tracing::{debug, error, instrument, warn};

const MAX_ATTEMPTS: u32 = 3;

/// Renew a Vault token, returning the new lease in seconds.
#[instrument(skip(token))]
async fn renew_token(vault_url: &str, token: &SecretString, increment: Option<u64>) -> Result<u64> {
    let renew_url = vault::endpoint_url(vault_url, "/v1/auth/token/renew-self")?;

    let payload = json!({
        "increment": increment.unwrap_or(0)
    });

    let response = vault::client()?
        .post(&renew_url)
        .json(&payload)
        .header("X-Vault-Token", token.expose_secret())
        .send()
        .await?;

    let json_response = vault::error_for_status(&renew_url, response).await?;

    json_response["auth"]["lease_duration"]
        .as_u64()
        .ok_or_else(|| anyhow!("Error parsing JSON response: no lease_duration found"))
}

/// Next renewal after 70-90% of the lease.
fn jittered(lease_duration: u64, rng: &mut StdRng) -> Duration {
    let factor = rng.gen_range(70..90);
    Duration::from_secs(lease_duration * factor / 100)
}

/// Keep the Vault token alive in the background. After three failed
/// attempts in a row a message on `tx` asks the server to shut down.
///
/// # Errors
/// Currently infallible; kept fallible for callers using `?`.
#[instrument(skip(globals, tx))]
pub async fn try_renew(
    globals: &GlobalArgs,
    lease_duration: u64,
    tx: mpsc::UnboundedSender<()>,
) -> Result<()> {
    tokio::spawn({
        let mut rng = StdRng::from_entropy();
        let mut next_renewal = jittered(lease_duration, &mut rng);

        let url = globals.vault_url.clone();
        let token = globals.vault_token.clone();

        async move {
            loop {
                debug!("Will renew token in {} seconds", next_renewal.as_secs());
                sleep(next_renewal).await;

                for attempt in 1..=MAX_ATTEMPTS {
                    let backoff_time = 2u64.pow(attempt - 1);

                    if attempt > 1 {
                        warn!("Backing off for {} seconds", backoff_time);
                        sleep(Duration::from_secs(backoff_time)).await;
                    }

                    match renew_token(&url, &token, None).await {
                        Ok(lease_duration) => {
                            next_renewal = jittered(lease_duration, &mut rng);
                            break;
                        }

                        Err(e) => {
                            error!("Failed to renew token: {}", e);

                            if attempt == MAX_ATTEMPTS {
                                error!("Failed to renew token after {MAX_ATTEMPTS} attempts: {}", e);
                                let _ = tx.send(());
                                return;
                            }
                        }
                    }
                }
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renewal_happens_before_lease_ends() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let next = jittered(1000, &mut rng);
            assert!(next >= Duration::from_secs(700));
            assert!(next < Duration::from_secs(900));
        }
    }
}
