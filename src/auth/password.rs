//! One-way credential hashing with argon2id.
//!
//! Stored credentials are PHC strings, so algorithm, version, cost parameters
//! and salt travel with the hash and old credentials keep verifying after the
//! cost is raised.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::rngs::OsRng;
use std::{fmt, sync::Arc, sync::OnceLock};
use tracing::{debug, instrument};

use super::error::AuthError;

const DUMMY_PASSWORD: &str = "portier-dummy-password";

/// A stored password hash in PHC format.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    #[must_use]
    pub fn from_phc(phc: impl Into<String>) -> Self {
        Self(phc.into())
    }

    /// The PHC string, for persisting.
    #[must_use]
    pub fn as_phc(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

#[derive(Clone)]
pub struct CredentialHasher {
    params: Params,
    dummy: Arc<OnceLock<Credential>>,
}

impl fmt::Debug for CredentialHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialHasher")
            .field("m_cost", &self.params.m_cost())
            .field("t_cost", &self.params.t_cost())
            .field("p_cost", &self.params.p_cost())
            .finish()
    }
}

impl Default for CredentialHasher {
    fn default() -> Self {
        Self {
            params: Params::default(),
            dummy: Arc::new(OnceLock::new()),
        }
    }
}

impl CredentialHasher {
    /// Hasher with explicit argon2 costs (memory in KiB, iterations, lanes).
    ///
    /// # Errors
    /// Returns an error if argon2 rejects the parameters.
    pub fn with_params(m_cost: u32, t_cost: u32, p_cost: u32) -> Result<Self, AuthError> {
        let params = Params::new(m_cost, t_cost, p_cost, None)
            .map_err(|e| AuthError::Internal(format!("argon2 params: {e}")))?;
        Ok(Self {
            params,
            dummy: Arc::new(OnceLock::new()),
        })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Hash `plaintext` with a fresh random salt.
    ///
    /// # Errors
    /// Returns an error if hashing fails.
    pub fn hash(&self, plaintext: &str) -> Result<Credential, AuthError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(plaintext.as_bytes(), &salt)
            .map_err(|e| AuthError::Internal(format!("argon2 hash: {e}")))?;
        Ok(Credential(hash.to_string()))
    }

    /// Constant-time check of `plaintext` against `credential`.
    ///
    /// A credential that does not parse verifies as `false`.
    #[must_use]
    pub fn verify(&self, plaintext: &str, credential: &Credential) -> bool {
        let Ok(parsed) = PasswordHash::new(&credential.0) else {
            debug!("stored credential is not a valid PHC string");
            return false;
        };
        // Costs come from the PHC string, not from `self.params`.
        Argon2::default()
            .verify_password(plaintext.as_bytes(), &parsed)
            .is_ok()
    }

    /// Whether `credential` was made with another algorithm or weaker costs
    /// than this hasher's, and should be replaced after a successful login.
    #[must_use]
    pub fn needs_rehash(&self, credential: &Credential) -> bool {
        let Ok(parsed) = PasswordHash::new(&credential.0) else {
            return true;
        };
        if parsed.algorithm != Algorithm::Argon2id.ident() {
            return true;
        }
        if parsed.version != Some(Version::V0x13.into()) {
            return true;
        }
        let Ok(stored) = Params::try_from(&parsed) else {
            return true;
        };
        stored.m_cost() < self.params.m_cost()
            || stored.t_cost() < self.params.t_cost()
            || stored.p_cost() < self.params.p_cost()
    }

    /// Burn one verification for an unknown account so lookups of missing
    /// identifiers take as long as wrong passwords.
    pub fn dummy_verify(&self, plaintext: &str) {
        let dummy = self.dummy.get_or_init(|| {
            self.hash(DUMMY_PASSWORD)
                .unwrap_or_else(|_| Credential(String::new()))
        });
        let _ = self.verify(plaintext, dummy);
    }

    /// [`Self::hash`] on the blocking pool.
    ///
    /// # Errors
    /// Returns an error if hashing fails or the blocking task panics.
    #[instrument(skip_all)]
    pub async fn hash_async(&self, plaintext: String) -> Result<Credential, AuthError> {
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || hasher.hash(&plaintext))
            .await
            .map_err(|e| AuthError::Internal(format!("hash task: {e}")))?
    }

    /// [`Self::verify`] on the blocking pool; `None` runs a dummy verification.
    ///
    /// # Errors
    /// Returns an error if the blocking task panics.
    #[instrument(skip_all)]
    pub async fn verify_async(
        &self,
        plaintext: String,
        credential: Option<Credential>,
    ) -> Result<bool, AuthError> {
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || match credential {
            Some(credential) => hasher.verify(&plaintext, &credential),
            None => {
                hasher.dummy_verify(&plaintext);
                false
            }
        })
        .await
        .map_err(|e| AuthError::Internal(format!("verify task: {e}")))
    }
}
