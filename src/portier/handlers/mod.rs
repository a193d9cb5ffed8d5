pub mod auth;
pub use self::auth::{login, logout, refresh, session};

pub mod health;
pub use self::health::health;
