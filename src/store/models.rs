use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Version metadata of a KV v2 secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMetadata {
    pub created_time: DateTime<Utc>,
    /// Set while the version is soft-deleted.
    #[serde(
        default,
        deserialize_with = "deserialize_optional_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub deletion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub destroyed: bool,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_metadata: Option<BTreeMap<String, String>>,
}

impl SecretMetadata {
    pub fn is_deleted(&self) -> bool {
        self.deletion_time.is_some()
    }
}

/// A secret's value together with the metadata of the version it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecretRecord {
    pub key: String,
    pub data: Map<String, Value>,
    pub metadata: SecretMetadata,
}

/// Vault reports "no deletion" as `""` or as Go's zero time.
fn deserialize_optional_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    let Some(raw) = raw.filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };
    let parsed = DateTime::parse_from_rfc3339(&raw)
        .map_err(serde::de::Error::custom)?
        .with_timezone(&Utc);
    Ok((parsed.year() > 1).then_some(parsed))
}

/// `{"data": ...}` envelope used by every KV v2 response.
#[derive(Deserialize)]
pub(crate) struct Envelope<T> {
    pub(crate) data: Option<T>,
}

/// Payload of `GET {engine}/data/{key}`.
#[derive(Deserialize)]
pub(crate) struct VersionedData {
    #[serde(default)]
    pub(crate) data: Option<Value>,
    #[serde(default)]
    pub(crate) metadata: Option<SecretMetadata>,
}

#[derive(Deserialize)]
pub(crate) struct KeyList {
    #[serde(default)]
    pub(crate) keys: Vec<String>,
}

#[derive(Serialize)]
pub(crate) struct WriteBody<'a> {
    pub(crate) data: &'a Map<String, Value>,
}

/// Body of undelete and destroy; Vault takes the versions as strings.
#[derive(Debug, Serialize)]
pub(crate) struct VersionsBody {
    versions: Vec<String>,
}

impl VersionsBody {
    pub(crate) fn new(versions: &[u64]) -> Self {
        Self {
            versions: versions.iter().map(u64::to_string).collect(),
        }
    }
}
