use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::auth::{AuthMethod, JwtAuth, OidcTokenSource};
use crate::client::BackendClient;
use crate::config::VaultConfig;
use crate::error::Result;
use crate::session::{LifecycleSettings, SessionHandle, SessionManager};
use crate::store::SecretStore;

/// A logged-in Vault client: secret operations plus the task keeping the
/// session alive.
pub struct Vault {
    secrets: SecretStore,
    manager: SessionManager,
}

impl Vault {
    /// Log in with the configured OIDC client and start the token lifecycle.
    ///
    /// The lifecycle runs until `cancel` fires or [`shutdown`](Self::shutdown)
    /// is called.
    pub async fn connect(config: &VaultConfig, cancel: &CancellationToken) -> Result<Self> {
        config.validate()?;

        let client = BackendClient::new(&config.vault_url, config.lifecycle.request_timeout)?;
        let identity = OidcTokenSource::new(
            client.http().clone(),
            config.auth_url.clone(),
            config.auth_realm.clone(),
            config.auth_client_id.clone(),
            SecretString::from(config.auth_client_secret.expose_secret().to_owned()),
        );
        let auth = JwtAuth::new(identity, config.vault_role.clone())
            .with_mount(config.lifecycle.auth_mount.clone());

        info!(
            address = %client.address(),
            engine = %config.vault_engine,
            role = %config.vault_role,
            "connecting to vault"
        );

        Self::connect_with(
            client,
            Arc::new(auth),
            config.vault_engine.clone(),
            LifecycleSettings::from(&config.lifecycle),
            cancel,
        )
        .await
    }

    /// Connect with an arbitrary auth method.
    pub async fn connect_with(
        client: BackendClient,
        auth: Arc<dyn AuthMethod>,
        engine: impl Into<String>,
        settings: LifecycleSettings,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let manager = SessionManager::start(client.clone(), auth, settings, cancel).await?;
        let secrets = SecretStore::new(client, engine, manager.handle());
        Ok(Self { secrets, manager })
    }

    pub fn secrets(&self) -> &SecretStore {
        &self.secrets
    }

    pub fn session(&self) -> SessionHandle {
        self.manager.handle()
    }

    pub fn is_running(&self) -> bool {
        self.manager.is_running()
    }

    /// Stop the token lifecycle. Outstanding [`SecretStore`] clones keep the
    /// last published token.
    pub async fn shutdown(self) {
        self.manager.stop().await;
    }
}
