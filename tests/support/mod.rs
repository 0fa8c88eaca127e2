#![allow(dead_code)]

//! In-process stand-ins for Keycloak and Vault.
//!
//! One wiremock server plays both roles: the realm token endpoint, Vault's
//! JWT login and renew-self endpoints, and a stateful KV v2 engine mounted at
//! [`ENGINE`]. Tokens are issued as `token-1`, `token-2`, ... so tests can
//! tell which login a request was made with.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use secrecy::SecretString;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use vaultjwt::config::{LifecycleConfig, VaultConfig};
use vaultjwt::{LifecycleState, SessionHandle};
use wiremock::matchers::{body_string_contains, method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const ENGINE: &str = "secret";
pub const REALM: &str = "test";
pub const ROLE: &str = "app";
pub const CLIENT_ID: &str = "svc";
pub const CLIENT_SECRET: &str = "svc-secret";
pub const IDENTITY_JWT: &str = "idp-issued-jwt";

pub const LOGIN_PATH: &str = "/v1/auth/jwt/login";
pub const RENEW_PATH: &str = "/v1/auth/token/renew-self";

pub fn token_endpoint_path() -> String {
    format!("/auth/realms/{REALM}/protocol/openid-connect/token")
}

/// Lifecycle settings small enough for re-logins to happen within a test.
pub fn fast_lifecycle() -> LifecycleConfig {
    LifecycleConfig {
        relogin_backoff: Duration::from_millis(50),
        relogin_backoff_max: Duration::from_millis(200),
        request_timeout: Duration::from_secs(5),
        ..LifecycleConfig::default()
    }
}

pub fn config_for(uri: &str) -> VaultConfig {
    VaultConfig::new(
        uri,
        ROLE,
        uri,
        REALM,
        CLIENT_ID,
        SecretString::from(CLIENT_SECRET.to_string()),
        ENGINE,
    )
    .with_lifecycle(fast_lifecycle())
}

/// Wait until the published session token is `token`.
pub async fn wait_for_token(handle: &mut SessionHandle, token: &str) {
    use secrecy::ExposeSecret;

    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while handle.current().token().expose_secret() != token {
            if !handle.changed().await {
                return false;
            }
        }
        true
    })
    .await;
    assert_eq!(reached, Ok(true), "session never switched to {token}");
}

/// Poll until the lifecycle reports `state`.
pub async fn wait_for_state(handle: &SessionHandle, state: LifecycleState) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while handle.state() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "lifecycle stuck in {:?}, expected {state:?}",
        handle.state()
    );
}

/// Collect every lifecycle state published from now until the lifecycle
/// stops.
pub fn record_states(handle: &SessionHandle) -> JoinHandle<Vec<LifecycleState>> {
    let mut handle = handle.clone();
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(state) = handle.state_changed().await {
            seen.push(state);
        }
        seen
    })
}

struct Version {
    data: Option<Map<String, Value>>,
    created_time: DateTime<Utc>,
    deletion_time: Option<DateTime<Utc>>,
    destroyed: bool,
}

impl Version {
    fn metadata(&self, version: u64) -> Value {
        json!({
            "created_time": timestamp(self.created_time),
            "custom_metadata": null,
            "deletion_time": self.deletion_time.map(timestamp).unwrap_or_default(),
            "destroyed": self.destroyed,
            "version": version,
        })
    }

    fn is_readable(&self) -> bool {
        self.data.is_some() && self.deletion_time.is_none() && !self.destroyed
    }
}

struct State {
    next_token: u64,
    live_tokens: HashSet<String>,
    login_lease_secs: u64,
    login_renewable: bool,
    login_failures_left: u32,
    login_delay: Duration,
    renew_lease_secs: u64,
    renew_lease_overrides: HashMap<String, u64>,
    denied_renewals: HashSet<String>,
    kv: BTreeMap<String, Vec<Version>>,
    kv_tokens: Vec<String>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            next_token: 0,
            live_tokens: HashSet::new(),
            login_lease_secs: 3600,
            login_renewable: true,
            login_failures_left: 0,
            login_delay: Duration::ZERO,
            renew_lease_secs: 3600,
            renew_lease_overrides: HashMap::new(),
            denied_renewals: HashSet::new(),
            kv: BTreeMap::new(),
            kv_tokens: Vec::new(),
        }
    }
}

pub struct FakeVault {
    server: MockServer,
    state: Arc<Mutex<State>>,
}

impl FakeVault {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let state = Arc::new(Mutex::new(State::default()));

        Mock::given(method("POST"))
            .and(path(token_endpoint_path()))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains(format!("client_id={CLIENT_ID}")))
            .and(body_string_contains(format!("client_secret={CLIENT_SECRET}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": IDENTITY_JWT,
                "token_type": "Bearer",
                "expires_in": 300,
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(LoginResponder(Arc::clone(&state)))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path(RENEW_PATH))
            .respond_with(RenewResponder(Arc::clone(&state)))
            .mount(&server)
            .await;

        Mock::given(path_regex(format!("^/v1/{ENGINE}/")))
            .respond_with(KvResponder(Arc::clone(&state)))
            .mount(&server)
            .await;

        Self { server, state }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    pub fn config(&self) -> VaultConfig {
        config_for(&self.uri())
    }

    /// Lease and renewability of tokens issued by future logins.
    pub fn set_login_grant(&self, lease_secs: u64, renewable: bool) {
        let mut state = lock(&self.state);
        state.login_lease_secs = lease_secs;
        state.login_renewable = renewable;
    }

    /// Make the next `count` logins fail with a 500.
    pub fn fail_next_logins(&self, count: u32) {
        lock(&self.state).login_failures_left = count;
    }

    /// Renewing `token` revokes it and answers 403.
    pub fn deny_renewal_of(&self, token: &str) {
        lock(&self.state).denied_renewals.insert(token.to_string());
    }

    /// Renewing `token` grants `lease_secs` instead of the default.
    pub fn cap_renewal_of(&self, token: &str, lease_secs: u64) {
        lock(&self.state)
            .renew_lease_overrides
            .insert(token.to_string(), lease_secs);
    }

    /// Answer requests matching `mock` with it instead of the stateful fake.
    pub async fn override_with(&self, mock: Mock) {
        mock.with_priority(1).mount(&self.server).await;
    }

    /// Hold every later login response back by `delay`.
    pub fn slow_down_logins(&self, delay: Duration) {
        lock(&self.state).login_delay = delay;
    }

    pub fn issued_tokens(&self) -> u64 {
        lock(&self.state).next_token
    }

    /// Tokens presented to the KV engine, in request order.
    pub fn kv_tokens(&self) -> Vec<String> {
        lock(&self.state).kv_tokens.clone()
    }

    pub async fn requests_to(&self, request_path: &str) -> Vec<Request> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.url.path() == request_path)
            .collect()
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().expect("fake vault state poisoned")
}

fn timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn vault_error(status: u16, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(json!({ "errors": [message] }))
}

fn not_found() -> ResponseTemplate {
    ResponseTemplate::new(404).set_body_json(json!({ "errors": [] }))
}

fn token_of(request: &Request) -> Option<String> {
    request
        .headers
        .get("x-vault-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn auth_body(token: &str, accessor: &str, lease_secs: u64, renewable: bool) -> Value {
    json!({
        "request_id": "00000000-0000-0000-0000-000000000000",
        "lease_duration": 0,
        "renewable": false,
        "data": null,
        "auth": {
            "client_token": token,
            "accessor": accessor,
            "policies": ["default", "secrets"],
            "lease_duration": lease_secs,
            "renewable": renewable,
        }
    })
}

struct LoginResponder(Arc<Mutex<State>>);

impl Respond for LoginResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Ok(body) = serde_json::from_slice::<Value>(&request.body) else {
            return vault_error(400, "failed to parse JSON input");
        };
        if body["role"] != ROLE {
            return vault_error(400, "role could not be found");
        }
        if body["jwt"] != IDENTITY_JWT {
            return vault_error(400, "error validating token");
        }

        let mut state = lock(&self.0);
        if state.login_failures_left > 0 {
            state.login_failures_left -= 1;
            return vault_error(500, "internal error");
        }

        state.next_token += 1;
        let token = format!("token-{}", state.next_token);
        let accessor = format!("accessor-{}", state.next_token);
        state.live_tokens.insert(token.clone());

        ResponseTemplate::new(200)
            .set_body_json(auth_body(
                &token,
                &accessor,
                state.login_lease_secs,
                state.login_renewable,
            ))
            .set_delay(state.login_delay)
    }
}

struct RenewResponder(Arc<Mutex<State>>);

impl Respond for RenewResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut state = lock(&self.0);
        let Some(token) = token_of(request) else {
            return vault_error(400, "missing client token");
        };
        if !state.live_tokens.contains(&token) {
            return vault_error(403, "permission denied");
        }
        if state.denied_renewals.contains(&token) {
            state.live_tokens.remove(&token);
            return vault_error(403, "permission denied");
        }

        let lease = state
            .renew_lease_overrides
            .get(&token)
            .copied()
            .unwrap_or(state.renew_lease_secs);
        let accessor = token.replace("token", "accessor");
        ResponseTemplate::new(200).set_body_json(auth_body(&token, &accessor, lease, true))
    }
}

struct KvResponder(Arc<Mutex<State>>);

impl Respond for KvResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut state = lock(&self.0);

        let token = token_of(request);
        if let Some(token) = &token {
            state.kv_tokens.push(token.clone());
        }
        match token {
            Some(token) if state.live_tokens.contains(&token) => {}
            _ => return vault_error(403, "permission denied"),
        }

        let prefix = format!("/v1/{ENGINE}/");
        let rest = request.url.path().strip_prefix(&prefix).unwrap_or_default();
        let (section, key) = rest.split_once('/').unwrap_or((rest, ""));
        let key = urlencoding::decode(key)
            .map(|k| k.into_owned())
            .unwrap_or_default();

        match (request.method.as_str(), section) {
            ("GET", "metadata") if key.is_empty() => {
                let listing = request
                    .url
                    .query_pairs()
                    .any(|(k, v)| k == "list" && v == "true");
                if listing {
                    state.list()
                } else {
                    vault_error(405, "unsupported operation")
                }
            }
            ("GET", "data") => {
                let version = request
                    .url
                    .query_pairs()
                    .find(|(k, _)| k == "version")
                    .and_then(|(_, v)| v.parse::<u64>().ok());
                state.read(&key, version)
            }
            ("POST", "data") => state.write(&key, &request.body),
            ("DELETE", "data") => state.soft_delete(&key),
            ("DELETE", "metadata") => {
                state.kv.remove(&key);
                ResponseTemplate::new(204)
            }
            ("POST", "undelete") => state.undelete(&key, &request.body),
            ("POST", "destroy") => state.destroy(&key, &request.body),
            _ => vault_error(405, "unsupported operation"),
        }
    }
}

impl State {
    fn list(&self) -> ResponseTemplate {
        if self.kv.is_empty() {
            return not_found();
        }
        let keys: Vec<&String> = self.kv.keys().collect();
        ResponseTemplate::new(200).set_body_json(json!({ "data": { "keys": keys } }))
    }

    fn read(&self, key: &str, version: Option<u64>) -> ResponseTemplate {
        let Some(versions) = self.kv.get(key) else {
            return not_found();
        };
        let number = match version {
            Some(v) if v > 0 => v,
            _ => versions.len() as u64,
        };
        let Some(entry) = number
            .checked_sub(1)
            .and_then(|index| versions.get(index as usize))
        else {
            return not_found();
        };

        let metadata = entry.metadata(number);
        if entry.is_readable() {
            ResponseTemplate::new(200)
                .set_body_json(json!({ "data": { "data": entry.data, "metadata": metadata } }))
        } else {
            ResponseTemplate::new(404)
                .set_body_json(json!({ "data": { "data": null, "metadata": metadata } }))
        }
    }

    fn write(&mut self, key: &str, body: &[u8]) -> ResponseTemplate {
        let data = match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(mut body)) => match body.remove("data") {
                Some(Value::Object(data)) => data,
                _ => return vault_error(400, "no data provided"),
            },
            _ => return vault_error(400, "failed to parse JSON input"),
        };

        let versions = self.kv.entry(key.to_string()).or_default();
        versions.push(Version {
            data: Some(data),
            created_time: Utc::now(),
            deletion_time: None,
            destroyed: false,
        });
        let number = versions.len() as u64;
        let metadata = versions[versions.len() - 1].metadata(number);
        ResponseTemplate::new(200).set_body_json(json!({ "data": metadata }))
    }

    fn soft_delete(&mut self, key: &str) -> ResponseTemplate {
        if let Some(latest) = self.kv.get_mut(key).and_then(|v| v.last_mut()) {
            latest.deletion_time.get_or_insert_with(Utc::now);
        }
        ResponseTemplate::new(204)
    }

    fn undelete(&mut self, key: &str, body: &[u8]) -> ResponseTemplate {
        let Some(numbers) = versions_in(body) else {
            return vault_error(400, "no versions provided");
        };
        for entry in self.versions_mut(key, &numbers) {
            if !entry.destroyed {
                entry.deletion_time = None;
            }
        }
        ResponseTemplate::new(204)
    }

    fn destroy(&mut self, key: &str, body: &[u8]) -> ResponseTemplate {
        let Some(numbers) = versions_in(body) else {
            return vault_error(400, "no versions provided");
        };
        for entry in self.versions_mut(key, &numbers) {
            entry.destroyed = true;
            entry.data = None;
        }
        ResponseTemplate::new(204)
    }

    fn versions_mut<'a>(&'a mut self, key: &str, numbers: &'a [u64]) -> impl Iterator<Item = &'a mut Version> {
        self.kv
            .get_mut(key)
            .into_iter()
            .flat_map(|versions| versions.iter_mut().enumerate())
            .filter(move |(index, _)| numbers.contains(&(*index as u64 + 1)))
            .map(|(_, entry)| entry)
    }
}

fn versions_in(body: &[u8]) -> Option<Vec<u64>> {
    let body: Value = serde_json::from_slice(body).ok()?;
    body["versions"]
        .as_array()?
        .iter()
        .map(|v| v.as_str().and_then(|s| s.parse().ok()))
        .collect()
}
