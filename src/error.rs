//! Error types for identity, session and secret operations.

use thiserror::Error;

/// Result type for vault operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while authenticating or talking to the secret engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Network-level failure: connection refused, timeout, TLS, body read.
    #[error("Transport error during {operation}: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The identity provider or the backend rejected our credentials.
    #[error("Access denied by {authority} ({status}): {message}")]
    AuthDenied {
        authority: &'static str,
        status: u16,
        message: String,
    },

    /// The backend or the local configuration cannot work as set up.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// No readable secret at this key (or version).
    #[error("{}", not_found_message(.key, .version))]
    NotFound { key: String, version: Option<u64> },

    /// The backend answered with a body we do not understand.
    #[error("Unexpected response shape: {message}")]
    Schema { message: String },

    /// A JSON payload could not be converted to or from the requested type.
    #[error("Failed to decode {what}: {source}")]
    Decode {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    /// A mutating call returned a non-success status.
    #[error("Unexpected status {status} from {operation}: {message}")]
    UnexpectedStatus {
        operation: &'static str,
        status: u16,
        message: String,
    },

    /// The key cannot be used as a secret path.
    #[error("Invalid secret key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },
}

fn not_found_message(key: &str, version: &Option<u64>) -> String {
    match version {
        Some(version) => format!("Secret not found: {key} (version {version})"),
        None => format!("Secret not found: {key}"),
    }
}

impl Error {
    pub fn transport(operation: &'static str, source: reqwest::Error) -> Self {
        Self::Transport { operation, source }
    }

    pub fn auth_denied(authority: &'static str, status: u16, message: impl Into<String>) -> Self {
        Self::AuthDenied {
            authority,
            status,
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn not_found(key: impl Into<String>, version: Option<u64>) -> Self {
        Self::NotFound {
            key: key.into(),
            version,
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    pub fn decode(what: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Decode {
            what: what.into(),
            source,
        }
    }

    pub fn unexpected_status(
        operation: &'static str,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        Self::UnexpectedStatus {
            operation,
            status,
            message: message.into(),
        }
    }

    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// True for errors caused by a missing secret rather than a failed call.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
