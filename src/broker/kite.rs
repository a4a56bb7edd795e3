//! Kite Connect v3 HTTP client.
//!
//! Thin typed wrapper over the broker REST API: margins, order list, net
//! positions, and market-order placement, plus the login-URL / token-exchange
//! handshake used by the admin surface.

use super::types::{Margins, Order, OrderParams, Position, PositionsData, SessionData};
use super::{BrokerApi, BrokerError, BrokerResult, SessionFactory};
use crate::store::accounts::Account;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://api.kite.trade";
const LOGIN_BASE: &str = "https://kite.zerodha.com/connect/login";
const KITE_VERSION: &str = "3";
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Standard `{status, data}` response envelope.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ApiEnvelope<T> {
    #[allow(dead_code)]
    status: String,
    #[serde(default)]
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderData {
    order_id: String,
}

/// Broker login URL for an API key. The `state` query parameter added by the
/// admin surface rides back through the redirect to identify the account.
pub fn login_url(api_key: &str) -> String {
    format!("{LOGIN_BASE}?v=3&api_key={api_key}")
}

/// Token-exchange checksum: SHA-256 over api_key + request_token + api_secret.
pub fn session_checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hasher.update(request_token.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

fn map_reqwest_err(err: reqwest::Error) -> BrokerError {
    if err.is_timeout() {
        BrokerError::Transient(format!("request timed out: {err}"))
    } else {
        BrokerError::Transient(err.to_string())
    }
}

fn build_http_client() -> BrokerResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .user_agent("MirrorBot/1.0 (Replication Engine)")
        .build()
        .map_err(|e| BrokerError::Transient(format!("failed to build HTTP client: {e}")))
}

/// Decode a broker response, mapping auth rejections and error envelopes.
async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> BrokerResult<T> {
    let status = resp.status();
    let body = resp.text().await.map_err(map_reqwest_err)?;

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(BrokerError::Auth(format!("{status}: {body}")));
    }
    if !status.is_success() {
        return Err(BrokerError::Transient(format!("{status}: {body}")));
    }

    let envelope: ApiEnvelope<T> = serde_json::from_str(&body)
        .map_err(|e| BrokerError::Transient(format!("malformed broker response: {e}")))?;

    match envelope.data {
        Some(data) => Ok(data),
        None => {
            let message = envelope
                .message
                .unwrap_or_else(|| "response envelope missing data".to_string());
            if envelope.error_type.as_deref() == Some("TokenException") {
                Err(BrokerError::Auth(message))
            } else {
                Err(BrokerError::Transient(message))
            }
        }
    }
}

/// An authenticated session against the broker HTTP API.
pub struct KiteClient {
    http: Client,
    base_url: String,
    api_key: String,
    access_token: String,
}

impl KiteClient {
    pub fn new(base_url: &str, api_key: &str, access_token: &str) -> BrokerResult<Self> {
        Ok(Self {
            http: build_http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            access_token: access_token.to_string(),
        })
    }

    fn auth_header(&self) -> String {
        format!("token {}:{}", self.api_key, self.access_token)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> BrokerResult<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {url}");
        let resp = self
            .http
            .get(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(map_reqwest_err)?;
        decode(resp).await
    }
}

#[async_trait]
impl BrokerApi for KiteClient {
    async fn margins(&self) -> BrokerResult<Margins> {
        self.get_json("/user/margins").await
    }

    async fn orders(&self) -> BrokerResult<Vec<Order>> {
        self.get_json("/orders").await
    }

    async fn positions(&self) -> BrokerResult<Vec<Position>> {
        let data: PositionsData = self.get_json("/portfolio/positions").await?;
        Ok(data.net)
    }

    async fn place_order(&self, params: &OrderParams) -> BrokerResult<String> {
        let url = format!("{}/orders/{}", self.base_url, params.variety);
        debug!("POST {url}");
        let resp = self
            .http
            .post(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", self.auth_header())
            .form(params)
            .send()
            .await
            .map_err(map_reqwest_err);

        // A failed placement is a placement error, never a reason to skip
        // the tick; only auth rejections keep their kind.
        let to_placement = |e: BrokerError| match e {
            BrokerError::Transient(m) | BrokerError::Placement(m) => BrokerError::Placement(m),
            auth @ BrokerError::Auth(_) => auth,
        };

        let data: PlaceOrderData = decode(resp.map_err(to_placement)?)
            .await
            .map_err(to_placement)?;
        Ok(data.order_id)
    }
}

/// Builds [`KiteClient`] sessions from stored account credentials.
pub struct KiteSessions {
    base_url: String,
}

impl KiteSessions {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    /// Exchange a login request token for an access token.
    pub async fn generate_session(
        &self,
        api_key: &str,
        api_secret: &str,
        request_token: &str,
    ) -> BrokerResult<SessionData> {
        let checksum = session_checksum(api_key, request_token, api_secret);
        let http = build_http_client()?;
        let resp = http
            .post(format!(
                "{}/session/token",
                self.base_url.trim_end_matches('/')
            ))
            .header("X-Kite-Version", KITE_VERSION)
            .form(&[
                ("api_key", api_key),
                ("request_token", request_token),
                ("checksum", checksum.as_str()),
            ])
            .send()
            .await
            .map_err(map_reqwest_err)?;
        decode(resp).await
    }
}

impl SessionFactory for KiteSessions {
    fn session(&self, account: &Account) -> BrokerResult<Arc<dyn BrokerApi>> {
        let access_token = account.access_token.clone().ok_or_else(|| {
            BrokerError::Auth(format!(
                "account {} has no access token; complete the broker login first",
                account.account_id
            ))
        })?;
        Ok(Arc::new(KiteClient::new(
            &self.base_url,
            &account.api_key,
            &access_token,
        )?))
    }
}
