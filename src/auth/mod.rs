//! Authentication and session security core.
//!
//! - [`password`]: argon2id credential hashing.
//! - [`token`]: signed access/refresh tokens, rotation and revocation.
//! - [`cookie`]: cookie transport for tokens.
//! - [`rate_limit`]: per-client fixed-window limits in the shared store.
//! - [`middleware`]: the per-request verification pipeline.
//! - [`activity`]: best-effort last-seen tracking.

pub mod activity;
pub mod clock;
pub mod cookie;
pub mod error;
pub mod middleware;
pub mod password;
pub mod principal;
pub mod rate_limit;
pub mod state;
pub mod token;

pub use error::AuthError;
pub use principal::{Authenticated, Principal, Role};
pub use state::{AuthConfig, AuthState};
