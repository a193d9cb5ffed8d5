pub mod auth;
pub mod cli;
pub mod portier;
pub mod store;
pub mod vault;
