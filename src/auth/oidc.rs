//! OIDC client-credentials token acquisition (Keycloak realm layout).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::client::{decode_json, send};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};

/// Access token returned by the identity provider.
#[derive(Debug)]
pub struct IdentityToken {
    access_token: SecretString,
    token_type: Option<String>,
    requested_at: DateTime<Utc>,
    expires_in: Option<Duration>,
}

impl IdentityToken {
    pub fn access_token(&self) -> &SecretString {
        &self.access_token
    }

    pub fn token_type(&self) -> Option<&str> {
        self.token_type.as_deref()
    }

    /// When the token request was sent, not when the response arrived.
    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }

    /// Nominal lifetime announced by the identity provider.
    pub fn expires_in(&self) -> Option<Duration> {
        self.expires_in
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let lifetime = chrono::Duration::from_std(self.expires_in?).ok()?;
        self.requested_at.checked_add_signed(lifetime)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// OAuth2 error body (`{"error": "...", "error_description": "..."}`).
#[derive(Deserialize)]
struct OAuthError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Client-credentials token source for one OIDC client.
///
/// Stateless between calls: every [`fetch`](Self::fetch) performs a new
/// token request. Retrying is up to the caller.
pub struct OidcTokenSource {
    http: Client,
    auth_url: String,
    realm: String,
    client_id: String,
    client_secret: SecretString,
    clock: Arc<dyn Clock>,
}

impl OidcTokenSource {
    pub fn new(
        http: Client,
        auth_url: impl Into<String>,
        realm: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
    ) -> Self {
        Self {
            http,
            auth_url: auth_url.into(),
            realm: realm.into(),
            client_id: client_id.into(),
            client_secret,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn token_endpoint(&self) -> String {
        format!(
            "{}/auth/realms/{}/protocol/openid-connect/token",
            self.auth_url.trim_end_matches('/'),
            urlencoding::encode(&self.realm)
        )
    }

    /// Request a new access token with the client credentials grant.
    pub async fn fetch(&self) -> Result<IdentityToken> {
        let requested_at = self.clock.now();
        let form = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("grant_type", "client_credentials"),
        ];

        let response = send(
            self.http.post(self.token_endpoint()).form(&form[..]),
            "identity token request",
        )
        .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<OAuthError>(&body) {
                Ok(err) => match err.error_description {
                    Some(description) => format!("{}: {description}", err.error),
                    None => err.error,
                },
                Err(_) => body.trim().to_string(),
            };
            warn!(
                status = status.as_u16(),
                client_id = %self.client_id,
                realm = %self.realm,
                "identity provider rejected token request"
            );
            return Err(Error::auth_denied(
                "identity provider",
                status.as_u16(),
                message,
            ));
        }

        let body: TokenResponse = decode_json(response, "identity token response").await?;
        debug!(
            client_id = %self.client_id,
            expires_in = ?body.expires_in,
            "obtained identity token"
        );

        Ok(IdentityToken {
            access_token: SecretString::from(body.access_token),
            token_type: body.token_type,
            requested_at,
            expires_in: body.expires_in.map(Duration::from_secs),
        })
    }
}
