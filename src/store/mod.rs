//! KV v2 secret operations.
//!
//! Every call reads the session currently published by the lifecycle task,
//! so a token swapped underneath us is picked up by the next request without
//! any coordination.

mod models;

pub use models::{SecretMetadata, SecretRecord};

use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::client::{decode_json, error_message, expect_success, send, BackendClient};
use crate::error::{Error, Result};
use crate::session::SessionHandle;
use models::{Envelope, KeyList, VersionedData, VersionsBody, WriteBody};

/// Secret operations against one KV v2 engine mount.
#[derive(Debug, Clone)]
pub struct SecretStore {
    client: BackendClient,
    engine: String,
    session: SessionHandle,
}

impl SecretStore {
    pub fn new(client: BackendClient, engine: impl Into<String>, session: SessionHandle) -> Self {
        Self {
            client,
            engine: engine.into().trim_matches('/').to_string(),
            session,
        }
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// Latest readable version of `key`.
    pub async fn read(&self, key: &str) -> Result<Map<String, Value>> {
        Ok(self.read_record(key).await?.data)
    }

    pub async fn read_version(&self, key: &str, version: u64) -> Result<Map<String, Value>> {
        Ok(self.fetch_record(key, Some(version)).await?.data)
    }

    /// Latest version of `key` together with its metadata.
    pub async fn read_record(&self, key: &str) -> Result<SecretRecord> {
        self.fetch_record(key, None).await
    }

    pub async fn read_into<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let data = self.read(key).await?;
        from_object(key, data)
    }

    pub async fn read_version_into<T: DeserializeOwned>(&self, key: &str, version: u64) -> Result<T> {
        let data = self.read_version(key, version).await?;
        from_object(key, data)
    }

    /// Store `data` as a new version of `key`.
    pub async fn write(&self, key: &str, data: &Map<String, Value>) -> Result<SecretMetadata> {
        let path = self.path("data", key)?;
        let response = self
            .call(Method::POST, &path, "secret write", |request| {
                request.json(&WriteBody { data })
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = error_message(response).await;
            return Err(Error::unexpected_status("secret write", status.as_u16(), message));
        }

        let envelope: Envelope<SecretMetadata> =
            decode_json(response, "secret write response").await?;
        let metadata = envelope
            .data
            .ok_or_else(|| Error::schema("write response carries no version metadata"))?;
        debug!(key, version = metadata.version, "wrote secret");
        Ok(metadata)
    }

    /// Serialize `value` to a JSON object and write it.
    pub async fn write_from<T: Serialize>(&self, key: &str, value: &T) -> Result<SecretMetadata> {
        let what = format!("secret {key}");
        match serde_json::to_value(value).map_err(|e| Error::decode(&what, e))? {
            Value::Object(data) => self.write(key, &data).await,
            other => Err(Error::decode(
                what,
                <serde_json::Error as serde::ser::Error>::custom(format!(
                    "expected a JSON object, got {}",
                    json_kind(&other)
                )),
            )),
        }
    }

    /// Soft-delete the latest version of `key`.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path("data", key)?;
        let response = self.call(Method::DELETE, &path, "secret delete", |r| r).await?;
        expect_success(response, "secret delete").await?;
        debug!(key, "soft-deleted secret");
        Ok(())
    }

    /// Restore soft-deleted `versions` of `key`.
    pub async fn undelete(&self, key: &str, versions: &[u64]) -> Result<()> {
        let path = self.path("undelete", key)?;
        let body = VersionsBody::new(versions);
        let response = self
            .call(Method::POST, &path, "secret undelete", |r| r.json(&body))
            .await?;
        expect_success(response, "secret undelete").await?;
        debug!(key, ?versions, "undeleted secret versions");
        Ok(())
    }

    /// Permanently remove every version and the metadata of `key`.
    pub async fn purge(&self, key: &str) -> Result<()> {
        let path = self.path("metadata", key)?;
        let response = self.call(Method::DELETE, &path, "secret purge", |r| r).await?;
        expect_success(response, "secret purge").await?;
        debug!(key, "purged secret");
        Ok(())
    }

    /// Permanently remove the payload of `versions` of `key`.
    pub async fn destroy_versions(&self, key: &str, versions: &[u64]) -> Result<()> {
        let path = self.path("destroy", key)?;
        let body = VersionsBody::new(versions);
        let response = self
            .call(Method::POST, &path, "secret destroy", |r| r.json(&body))
            .await?;
        expect_success(response, "secret destroy").await?;
        debug!(key, ?versions, "destroyed secret versions");
        Ok(())
    }

    /// Keys at the root of the engine, in the order Vault returns them.
    ///
    /// Sub-folders show up with a trailing `/`. An engine with no keys yields
    /// an empty list rather than an error.
    pub async fn list_keys(&self) -> Result<Vec<String>> {
        let path = format!("{}/metadata", self.engine);
        let response = self
            .call(Method::GET, &path, "secret list", |r| {
                r.query(&[("list", "true")])
            })
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let message = error_message(response).await;
            return Err(Error::unexpected_status("secret list", status.as_u16(), message));
        }

        let envelope: Envelope<KeyList> = decode_json(response, "secret list response").await?;
        Ok(envelope.data.map(|list| list.keys).unwrap_or_default())
    }

    /// Metadata of the latest version, including soft-deleted ones.
    pub async fn get_metadata(&self, key: &str) -> Result<SecretMetadata> {
        let versioned = self
            .fetch_data(key, None)
            .await?
            .ok_or_else(|| Error::not_found(key, None))?;
        versioned
            .metadata
            .ok_or_else(|| Error::schema(format!("no metadata returned for {key}")))
    }

    async fn fetch_record(&self, key: &str, version: Option<u64>) -> Result<SecretRecord> {
        let versioned = self
            .fetch_data(key, version)
            .await?
            .ok_or_else(|| Error::not_found(key, version))?;

        let data = match versioned.data {
            Some(Value::Object(data)) => data,
            // Deleted and destroyed versions keep their metadata but lose the payload.
            None | Some(Value::Null) => return Err(Error::not_found(key, version)),
            Some(other) => {
                return Err(Error::schema(format!(
                    "secret {key} holds {} instead of an object",
                    json_kind(&other)
                )))
            }
        };
        let metadata = versioned
            .metadata
            .ok_or_else(|| Error::schema(format!("no metadata returned for {key}")))?;

        Ok(SecretRecord {
            key: key.to_string(),
            data,
            metadata,
        })
    }

    /// `GET {engine}/data/{key}`. `None` when Vault knows nothing about the key.
    ///
    /// A 404 for a deleted or destroyed version still carries its metadata,
    /// so the body is inspected before giving up.
    async fn fetch_data(&self, key: &str, version: Option<u64>) -> Result<Option<VersionedData>> {
        let path = self.path("data", key)?;
        let response = self
            .call(Method::GET, &path, "secret read", |r| match version {
                Some(version) => r.query(&[("version", version)]),
                None => r,
            })
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            let body = response.bytes().await.unwrap_or_default();
            let envelope = serde_json::from_slice::<Envelope<VersionedData>>(&body).ok();
            return Ok(envelope.and_then(|e| e.data));
        }
        if !status.is_success() {
            let message = error_message(response).await;
            return Err(Error::unexpected_status("secret read", status.as_u16(), message));
        }

        let envelope: Envelope<VersionedData> =
            decode_json(response, "secret read response").await?;
        Ok(envelope.data)
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        operation: &'static str,
        build: impl FnOnce(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
    ) -> Result<Response> {
        let session = self.session.current();
        send(build(self.client.authed(method, path, &session)), operation).await
    }

    fn path(&self, section: &str, key: &str) -> Result<String> {
        validate_key(key)?;
        let encoded: Vec<_> = key.split('/').map(urlencoding::encode).collect();
        Ok(format!("{}/{}/{}", self.engine, section, encoded.join("/")))
    }
}

/// Reject keys that would address something other than a single secret.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_key(key, "key is empty"));
    }
    if key.starts_with('/') {
        return Err(Error::invalid_key(key, "key must not start with '/'"));
    }
    for segment in key.split('/') {
        match segment {
            "" => return Err(Error::invalid_key(key, "key contains an empty path segment")),
            "." | ".." => {
                return Err(Error::invalid_key(
                    key,
                    format!("key contains a relative path segment {segment:?}"),
                ))
            }
            _ => {}
        }
    }
    Ok(())
}

fn from_object<T: DeserializeOwned>(key: &str, data: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(data)).map_err(|e| Error::decode(format!("secret {key}"), e))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
