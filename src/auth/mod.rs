//! Ways of obtaining a Vault session.
//!
//! [`AuthMethod`] is the seam the session lifecycle logs in through. The
//! JWT method fetches a client-credentials token from an OIDC identity
//! provider and exchanges it at Vault's JWT auth mount.

mod jwt;
mod oidc;

pub use jwt::JwtAuth;
pub use oidc::{IdentityToken, OidcTokenSource};

use async_trait::async_trait;

use crate::client::BackendClient;
use crate::error::Result;
use crate::session::SessionSecret;

/// Something that can log in to Vault and hand back a fresh session.
///
/// Implementations must not cache the session; the caller owns it. They are
/// called once at construction and again every time the lifecycle needs a
/// new token, so each call should go back to the original credentials.
#[async_trait]
pub trait AuthMethod: Send + Sync {
    async fn login(&self, client: &BackendClient) -> Result<SessionSecret>;

    fn name(&self) -> &str;
}
