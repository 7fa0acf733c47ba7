//! REST gateway to an array controller
//!
//! Speaks the controller's session-based JSON API: log in against the first
//! answering endpoint, replay the session token and cookie on every call,
//! unwrap the `{data, error}` envelope, and renew the session once when the
//! controller reports it expired.

use crate::array::model::codes;
use crate::config::ArrayAuthConfig;
use crate::domain::ports::ArrayGateway;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};

/// Account states that forbid API access until an operator intervenes
const ACCOUNT_PASSWORD_EXPIRED: &str = "3";
const ACCOUNT_MUST_RESET_PASSWORD: &str = "4";

const TOKEN_HEADER: &str = "iBaseToken";

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: EnvelopeError,
}

#[derive(Debug, Default, Deserialize)]
struct EnvelopeError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoginData {
    #[serde(rename = "deviceid")]
    device_id: String,
    #[serde(rename = "iBaseToken")]
    token: String,
    #[serde(rename = "accountstate")]
    account_state: Value,
}

#[derive(Debug, Clone)]
struct Session {
    url_prefix: String,
    token: String,
    cookie: Option<String>,
}

/// Gateway to a real array controller
pub struct RestGateway {
    name: String,
    config: ArrayAuthConfig,
    http: Client,
    session: RwLock<Option<Session>>,
}

impl std::fmt::Debug for RestGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestGateway")
            .field("name", &self.name)
            .field("endpoints", &self.config.endpoints)
            .finish()
    }
}

fn account_state(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

impl RestGateway {
    /// Build the gateway without contacting the array
    pub fn new(name: impl Into<String>, config: ArrayAuthConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .danger_accept_invalid_certs(config.insecure)
            .build()?;
        Ok(Self {
            name: name.into(),
            config,
            http,
            session: RwLock::new(None),
        })
    }

    /// Build the gateway and log in
    pub async fn connect(name: impl Into<String>, config: ArrayAuthConfig) -> Result<Self> {
        let gateway = Self::new(name, config)?;
        gateway.login().await?;
        Ok(gateway)
    }

    /// Open a session against the first endpoint that accepts the credentials
    #[instrument(skip(self), fields(array = %self.name))]
    pub async fn login(&self) -> Result<()> {
        let body = json!({
            "username": self.config.username,
            "password": self.config.password,
            "scope": "0",
        });

        let mut last_error = None;
        for endpoint in &self.config.endpoints {
            let endpoint = endpoint.trim_end_matches('/');
            let url = format!("{}/xxxxx/sessions", endpoint);
            debug!("Logging in to {}", url);

            let response = match self.http.post(&url).json(&body).send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!("Login to {} failed: {}", url, e);
                    last_error = Some(Error::Http(e));
                    continue;
                }
            };
            let cookie = response
                .headers()
                .get(reqwest::header::SET_COOKIE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let envelope: Envelope = match response.json().await {
                Ok(e) => e,
                Err(e) => {
                    warn!("Login to {} returned an unreadable body: {}", url, e);
                    last_error = Some(Error::Http(e));
                    continue;
                }
            };
            if envelope.error.code != 0 {
                warn!(
                    "Login to {} rejected, code: {}, description: {}",
                    url, envelope.error.code, envelope.error.description
                );
                last_error = Some(Error::Authentication(format!(
                    "{} (code {})",
                    envelope.error.description, envelope.error.code
                )));
                continue;
            }

            let data: LoginData = serde_json::from_value(envelope.data)?;
            let state = account_state(&data.account_state);
            if state == ACCOUNT_PASSWORD_EXPIRED || state == ACCOUNT_MUST_RESET_PASSWORD {
                error!("Account {} on {} needs a password change", self.config.username, endpoint);
                return Err(Error::Authentication(format!(
                    "account {} requires a password change (state {})",
                    self.config.username, state
                )));
            }
            if data.device_id.is_empty() {
                last_error = Some(Error::Authentication(format!("{} returned no device id", url)));
                continue;
            }

            *self.session.write() = Some(Session {
                url_prefix: format!("{}/{}", endpoint, data.device_id),
                token: data.token,
                cookie,
            });
            info!("Logged in to array {} via {}", self.name, endpoint);
            return Ok(());
        }

        Err(last_error.unwrap_or_else(|| Error::Configuration("no array endpoints configured".into())))
    }

    /// Close the session, a no-op when none is open
    pub async fn logout(&self) -> Result<()> {
        let open = self.session.read().is_some();
        if !open {
            return Ok(());
        }
        let result = self.send(Method::DELETE, "/sessions", None).await;
        *self.session.write() = None;
        match result {
            Ok(_) => {
                info!("Logged out of array {}", self.name);
                Ok(())
            }
            Err(e) => {
                warn!("Logout from array {} failed: {}", self.name, e);
                Err(e)
            }
        }
    }

    fn current_session(&self) -> Option<Session> {
        self.session.read().clone()
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let session = match self.current_session() {
            Some(s) => s,
            None => {
                self.login().await?;
                self.current_session()
                    .ok_or_else(|| Error::Internal("login produced no session".into()))?
            }
        };

        let url = format!("{}{}", session.url_prefix, path);
        debug!("{} {}", method, url);
        let mut request = self
            .http
            .request(method, &url)
            .header(TOKEN_HEADER, &session.token);
        if let Some(cookie) = &session.cookie {
            request = request.header(reqwest::header::COOKIE, cookie);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let envelope: Envelope = request.send().await?.json().await?;
        if envelope.error.code != 0 {
            return Err(Error::remote(envelope.error.code, envelope.error.description));
        }
        Ok(envelope.data)
    }

    /// One call with a single session renewal on expiry
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        match self.send(method.clone(), path, body.as_ref()).await {
            Err(e) if e.is_session_expired() => {
                warn!(
                    "Session on array {} expired ({}), logging in again",
                    self.name,
                    e.remote_code().unwrap_or(codes::SESSION_EXPIRED)
                );
                self.login().await?;
                self.send(method, path, body.as_ref()).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl ArrayGateway for RestGateway {
    async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, None).await
    }

    async fn create(&self, path: &str, body: Value) -> Result<Value> {
        self.request(Method::POST, path, Some(body)).await
    }

    async fn update(&self, path: &str, body: Value) -> Result<Value> {
        self.request(Method::PUT, path, Some(body)).await
    }

    async fn delete(&self, path: &str) -> Result<Value> {
        self.request(Method::DELETE, path, None).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_state_forms() {
        assert_eq!(account_state(&json!("3")), "3");
        assert_eq!(account_state(&json!(4)), "4");
        assert_eq!(account_state(&Value::Null), "");
    }

    #[test]
    fn test_envelope_defaults() {
        let envelope: Envelope = serde_json::from_str(r#"{"data":{"ID":"1"}}"#).unwrap();
        assert_eq!(envelope.error.code, 0);
        assert_eq!(envelope.data["ID"], "1");
    }

    #[tokio::test]
    async fn test_logout_without_session_is_noop() {
        let gateway = RestGateway::new("a", ArrayAuthConfig::default()).unwrap();
        assert!(gateway.logout().await.is_ok());
    }
}
