//! Thin HTTP transport for the Vault API.
//!
//! Knows how to address `/v1/...` paths, attach a session token, and turn
//! Vault's `{"errors": [...]}` bodies into readable messages. Everything
//! above this layer speaks in logical operations.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response};
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::session::{AuthEnvelope, SessionSecret};

const TOKEN_HEADER: &str = "X-Vault-Token";

/// Shared handle to a Vault server. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: Client,
    address: Arc<str>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

impl BackendClient {
    /// Create a client for the Vault server at `address`.
    ///
    /// A trailing `/ui` (the address users tend to copy from the browser) is
    /// stripped, as is any trailing slash.
    pub fn new(address: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vaultjwt/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::configuration(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self::with_client(http, address))
    }

    /// Create a client around an existing reqwest client.
    pub fn with_client(http: Client, address: &str) -> Self {
        let address = address.trim_end_matches('/');
        let address = address.strip_suffix("/ui").unwrap_or(address);
        Self {
            http,
            address: Arc::from(address),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// The underlying reqwest client, shared with the identity provider calls.
    pub fn http(&self) -> &Client {
        &self.http
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.address, path.trim_start_matches('/'))
    }

    /// Unauthenticated request, used for login.
    pub(crate) fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, self.url(path))
            .header("Accept", "application/json")
    }

    /// Request carrying the session token.
    pub(crate) fn authed(
        &self,
        method: Method,
        path: &str,
        session: &SessionSecret,
    ) -> RequestBuilder {
        self.request(method, path)
            .header(TOKEN_HEADER, session.token().expose_secret())
    }

    /// Extend the lease of `session` by `increment`.
    ///
    /// Returns a new session value; the old one is left untouched.
    pub async fn renew_self(
        &self,
        session: &SessionSecret,
        increment: Duration,
    ) -> Result<SessionSecret> {
        let response = send(
            self.authed(Method::POST, "auth/token/renew-self", session)
                .json(&serde_json::json!({ "increment": increment.as_secs() })),
            "token renewal",
        )
        .await?;

        let status = response.status();
        if !status.is_success() {
            let message = error_message(response).await;
            return Err(Error::auth_denied("vault", status.as_u16(), message));
        }

        let envelope: AuthEnvelope = decode_json(response, "token renewal response").await?;
        envelope.into_session()
    }
}

/// Send a request, mapping network failures to [`Error::Transport`].
pub(crate) async fn send(request: RequestBuilder, operation: &'static str) -> Result<Response> {
    request
        .send()
        .await
        .map_err(|e| Error::transport(operation, e))
}

/// Read a JSON body into `T`.
pub(crate) async fn decode_json<T>(response: Response, what: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let body = response
        .bytes()
        .await
        .map_err(|e| Error::transport("reading response body", e))?;
    serde_json::from_slice(&body).map_err(|e| Error::decode(what, e))
}

/// Fail with [`Error::UnexpectedStatus`] unless the response is 2xx.
pub(crate) async fn expect_success(response: Response, operation: &'static str) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let message = error_message(response).await;
    Err(Error::unexpected_status(operation, status.as_u16(), message))
}

/// Best-effort human readable message from an error response.
pub(crate) async fn error_message(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) if !parsed.errors.is_empty() => parsed.errors.join("; "),
        _ if body.trim().is_empty() => status
            .canonical_reason()
            .unwrap_or("no response body")
            .to_string(),
        _ => body.trim().to_string(),
    }
}
