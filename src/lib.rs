//! Vault KV v2 client authenticated with an OIDC client-credentials JWT.
//!
//! [`Vault::connect`] logs in once, then keeps the session token alive in a
//! background task (renewing it, and logging in again whenever it can no
//! longer be renewed) while [`SecretStore`] operations run against whatever
//! token is current.

pub mod auth;
pub mod client;
pub mod clock;
pub mod config;
pub mod duration;
pub mod error;
pub mod session;
pub mod store;
mod vault;

pub use config::VaultConfig;
pub use error::{Error, Result};
pub use session::{LifecycleState, SessionHandle, SessionSecret};
pub use store::{SecretMetadata, SecretRecord, SecretStore};
pub use vault::Vault;
