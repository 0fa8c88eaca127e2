use async_trait::async_trait;
use reqwest::Method;
use secrecy::ExposeSecret;
use serde::Serialize;
use tracing::{debug, warn};

use super::{AuthMethod, OidcTokenSource};
use crate::client::{decode_json, error_message, send, BackendClient};
use crate::error::{Error, Result};
use crate::session::{AuthEnvelope, SessionSecret};

const DEFAULT_MOUNT: &str = "jwt";

#[derive(Serialize)]
struct LoginBody<'a> {
    role: &'a str,
    jwt: &'a str,
}

/// Vault JWT auth method backed by an OIDC client-credentials token.
pub struct JwtAuth {
    identity: OidcTokenSource,
    role: String,
    mount: String,
}

impl JwtAuth {
    pub fn new(identity: OidcTokenSource, role: impl Into<String>) -> Self {
        Self {
            identity,
            role: role.into(),
            mount: DEFAULT_MOUNT.to_string(),
        }
    }

    /// Use a JWT auth method mounted somewhere other than `auth/jwt`.
    pub fn with_mount(mut self, mount: impl Into<String>) -> Self {
        self.mount = mount.into().trim_matches('/').to_string();
        self
    }

    pub fn login_path(&self) -> String {
        format!("auth/{}/login", self.mount)
    }
}

#[async_trait]
impl AuthMethod for JwtAuth {
    async fn login(&self, client: &BackendClient) -> Result<SessionSecret> {
        let identity = self.identity.fetch().await?;

        let body = LoginBody {
            role: &self.role,
            jwt: identity.access_token().expose_secret(),
        };
        let response = send(
            client
                .request(Method::POST, &self.login_path())
                .json(&body),
            "vault login",
        )
        .await?;

        let status = response.status();
        if !status.is_success() {
            let message = error_message(response).await;
            warn!(
                status = status.as_u16(),
                role = %self.role,
                mount = %self.mount,
                "vault rejected jwt login"
            );
            return Err(Error::auth_denied("vault", status.as_u16(), message));
        }

        let envelope: AuthEnvelope = decode_json(response, "vault login response").await?;
        let session = envelope.into_session()?;
        debug!(
            role = %self.role,
            renewable = session.is_renewable(),
            lease_secs = session.lease_duration().as_secs(),
            "vault jwt login succeeded"
        );
        Ok(session)
    }

    fn name(&self) -> &str {
        "jwt"
    }
}
