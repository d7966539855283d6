//! HTTP transport backed by reqwest.
//!
//! Routes follow the service's REST layout. Authenticated calls carry the
//! identity's token as a bearer header; bodies are JSON in both directions.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::{Transport, TransportError, TransportResult};
use crate::connection::Identity;

/// Configuration for [`HttpTransport`]
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Base URL of the service, without trailing slash
    pub base_url: String,
    /// Per-request timeout enforced by the HTTP client
    pub timeout: Duration,
}

impl HttpTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self::new("http://localhost:5000/api")
    }
}

/// Transport that talks to the real service over HTTP
pub struct HttpTransport {
    client: Client,
    config: HttpTransportConfig,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> TransportResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TransportError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn request(&self, method: Method, path: &str, identity: Option<&Identity>) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match identity {
            Some(identity) => builder.bearer_auth(&identity.auth_token),
            None => builder,
        }
    }

    /// Send a request and return the JSON body of a 2xx response
    async fn send(&self, builder: RequestBuilder) -> TransportResult<Value> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                body,
            });
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&body).map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn get(&self, path: &str, identity: &Identity) -> TransportResult<Value> {
        debug!("GET {}", path);
        self.send(self.request(Method::GET, path, Some(identity))).await
    }

    async fn post(
        &self,
        path: &str,
        identity: Option<&Identity>,
        body: Value,
    ) -> TransportResult<Value> {
        debug!("POST {}", path);
        self.send(self.request(Method::POST, path, identity).json(&body))
            .await
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self, display_name: &str) -> TransportResult<Value> {
        self.post("/users/connect", None, json!({ "displayName": display_name }))
            .await
    }

    async fn reconnect(&self, user_id: &str, auth_token: &str) -> TransportResult<Value> {
        self.post(
            "/users/reconnect",
            None,
            json!({ "userId": user_id, "authToken": auth_token }),
        )
        .await
    }

    async fn disconnect(&self, identity: &Identity) -> TransportResult<Value> {
        self.post(
            "/users/disconnect",
            Some(identity),
            json!({ "userId": identity.user_id, "connectionId": identity.connection_id }),
        )
        .await
    }

    async fn logout(&self, auth_token: &str) -> TransportResult<Value> {
        self.send(
            self.request(Method::POST, "/users/logout", None)
                .bearer_auth(auth_token)
                .json(&json!({ "authToken": auth_token })),
        )
        .await
    }

    async fn list_peers(&self, identity: &Identity) -> TransportResult<Value> {
        self.get(&format!("/users/{}/peers", identity.user_id), identity)
            .await
    }

    async fn list_pairing_requests(&self, identity: &Identity) -> TransportResult<Value> {
        self.get(
            &format!("/users/{}/pairing-requests", identity.user_id),
            identity,
        )
        .await
    }

    async fn request_pairing(
        &self,
        identity: &Identity,
        target_id: &str,
    ) -> TransportResult<Value> {
        self.post(
            "/pairing-requests",
            Some(identity),
            json!({ "requesterId": identity.user_id, "targetId": target_id }),
        )
        .await
    }

    async fn respond_pairing(
        &self,
        identity: &Identity,
        request_id: &str,
        approve: bool,
    ) -> TransportResult<Value> {
        self.post(
            &format!("/pairing-requests/{}/respond", request_id),
            Some(identity),
            json!({ "userId": identity.user_id, "approve": approve }),
        )
        .await
    }

    async fn cancel_pairing(&self, identity: &Identity, target_id: &str) -> TransportResult<Value> {
        self.post(
            "/pairing-requests/cancel",
            Some(identity),
            json!({ "requesterId": identity.user_id, "targetId": target_id }),
        )
        .await
    }

    async fn snapshot(&self, identity: &Identity) -> TransportResult<Value> {
        self.get(&format!("/users/{}/snapshot", identity.user_id), identity)
            .await
    }

    async fn user_status(&self, identity: &Identity) -> TransportResult<Value> {
        self.get(&format!("/users/{}/status", identity.user_id), identity)
            .await
    }

    async fn start_session(&self, identity: &Identity) -> TransportResult<Value> {
        self.post(
            "/sessions",
            Some(identity),
            json!({ "userId": identity.user_id }),
        )
        .await
    }

    async fn end_session(&self, identity: &Identity, session_id: &str) -> TransportResult<Value> {
        self.post(
            &format!("/sessions/{}/end", session_id),
            Some(identity),
            json!({ "userId": identity.user_id }),
        )
        .await
    }

    async fn draw_card(
        &self,
        identity: &Identity,
        session_id: &str,
        content: &str,
    ) -> TransportResult<Value> {
        self.post(
            &format!("/sessions/{}/cards", session_id),
            Some(identity),
            json!({ "userId": identity.user_id, "content": content }),
        )
        .await
    }
}
