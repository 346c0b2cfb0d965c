//! ERP HTTP client.
//!
//! [`ErpClient`] is the seam the orchestrator depends on; [`HttpErpClient`]
//! implements it over JSON with a cached bearer token. A `401` answer
//! triggers exactly one re-authentication and one replay of the request.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | authenticate | `POST /api/session` |
//! | list pending orders | `GET /api/work-orders?state=pending&limit=&offset=` |
//! | push consumption | `POST /api/work-orders/{id}/consumption` |
//! | mark done | `POST /api/work-orders/{id}/done` |
//! | cancel | `POST /api/work-orders/{id}/cancel` |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors raised while talking to the ERP.
#[derive(Debug, Error)]
pub enum ErpError {
    /// Transport-level failure (connect, timeout, TLS).
    #[error("network: {0}")]
    Http(#[from] reqwest::Error),

    /// The ERP answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Status {
        /// Status code.
        status: u16,
        /// Response body.
        message: String,
    },

    /// Login was refused.
    #[error("auth: {0}")]
    Auth(String),

    /// The response body did not match the expected shape.
    #[error("decode: {0}")]
    Decode(String),
}

/// One component line of a pending work order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderComponent {
    /// Product code.
    pub product_code: String,
    /// Product name.
    #[serde(default)]
    pub name: Option<String>,
    /// Planned quantity.
    pub quantity: f64,
    /// Dosing equipment; decides solid versus liquid.
    #[serde(default)]
    pub equipment: Option<String>,
}

/// A work order waiting to be produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    /// Work order id.
    pub work_order: String,
    /// Production line.
    pub equipment: String,
    /// Planned finished quantity.
    pub quantity: f64,
    /// Component lines.
    #[serde(default)]
    pub components: Vec<OrderComponent>,
}

/// Consumed quantity of one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionLine {
    /// Product code.
    pub product_code: String,
    /// Consumed quantity.
    pub quantity: f64,
}

/// Consumption pushed when a batch completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionReport {
    /// Finished weight, if the PLC reported one.
    pub finished_weight: Option<f64>,
    /// Consumed components. Components without a reading are omitted.
    pub lines: Vec<ConsumptionLine>,
}

/// ERP answer to a consumption push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionAck {
    /// Whether the ERP booked the report.
    pub accepted: bool,
    /// Product codes the ERP refused.
    #[serde(default)]
    pub rejected_components: Vec<String>,
}

impl ConsumptionAck {
    /// Returns whether every line was booked.
    pub fn fully_accepted(&self) -> bool {
        self.accepted && self.rejected_components.is_empty()
    }
}

/// Operations the gateway needs from the ERP.
#[async_trait]
pub trait ErpClient: Send + Sync {
    /// Logs in and caches the session token.
    async fn authenticate(&self) -> Result<(), ErpError>;

    /// Lists pending work orders.
    async fn list_pending_orders(&self, limit: u32, offset: u32) -> Result<Vec<PendingOrder>, ErpError>;

    /// Books consumption against a work order.
    async fn push_consumption(
        &self,
        work_order: &str,
        equipment: &str,
        report: &ConsumptionReport,
    ) -> Result<ConsumptionAck, ErpError>;

    /// Closes a work order with the finished quantity.
    async fn mark_done(&self, work_order: &str, finished_qty: f64) -> Result<(), ErpError>;

    /// Cancels a work order.
    async fn cancel_order(&self, work_order: &str) -> Result<(), ErpError>;
}

/// Connection settings for [`HttpErpClient`].
#[derive(Debug, Clone)]
pub struct ErpSettings {
    /// Base URL, without trailing slash.
    pub base_url: String,
    /// Login user.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Whole-request timeout.
    pub timeout: Duration,
}

#[derive(Deserialize)]
struct SessionResponse {
    #[serde(alias = "access_token")]
    token: String,
}

#[derive(Deserialize)]
struct ListResponse<T> {
    items: Vec<T>,
}

#[derive(Serialize)]
struct ConsumptionRequest<'a> {
    equipment: &'a str,
    #[serde(flatten)]
    report: &'a ConsumptionReport,
}

/// JSON-over-HTTP ERP client.
pub struct HttpErpClient {
    http: reqwest::Client,
    settings: ErpSettings,
    token: RwLock<Option<String>>,
}

impl HttpErpClient {
    /// Builds the client. No request is sent until the first call.
    pub fn new(mut settings: ErpSettings) -> Result<Self, ErpError> {
        settings.base_url = settings.base_url.trim_end_matches('/').to_string();
        let http = reqwest::Client::builder().timeout(settings.timeout).build()?;
        Ok(Self {
            http,
            settings,
            token: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url, path)
    }

    fn order_path(work_order: &str, action: &str) -> String {
        format!("/api/work-orders/{}/{action}", urlencoding::encode(work_order))
    }

    async fn login(&self) -> Result<String, ErpError> {
        let resp = self
            .http
            .post(self.url("/api/session"))
            .json(&serde_json::json!({
                "username": self.settings.username,
                "password": self.settings.password,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ErpError::Auth(format!("login failed ({status}): {body}")));
        }
        let session: SessionResponse = resp
            .json()
            .await
            .map_err(|e| ErpError::Decode(format!("session response: {e}")))?;

        *self.token.write().await = Some(session.token.clone());
        tracing::debug!(base_url = %self.settings.base_url, "ERP session established");
        Ok(session.token)
    }

    async fn current_token(&self) -> Result<String, ErpError> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.clone());
        }
        self.login().await
    }

    /// Sends the request built by `build`, re-authenticating once on 401.
    async fn send<F>(&self, build: F) -> Result<Response, ErpError>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let token = self.current_token().await?;
        let resp = build().bearer_auth(&token).send().await?;
        let resp = if resp.status() == StatusCode::UNAUTHORIZED {
            tracing::info!("ERP session expired, re-authenticating");
            let token = self.login().await?;
            build().bearer_auth(&token).send().await?
        } else {
            resp
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(ErpError::Status { status, message });
        }
        Ok(resp)
    }

    async fn decode<T: DeserializeOwned>(resp: Response, what: &str) -> Result<T, ErpError> {
        resp.json()
            .await
            .map_err(|e| ErpError::Decode(format!("{what}: {e}")))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, self.url(path))
    }
}

impl std::fmt::Debug for HttpErpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpErpClient")
            .field("base_url", &self.settings.base_url)
            .field("username", &self.settings.username)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ErpClient for HttpErpClient {
    async fn authenticate(&self) -> Result<(), ErpError> {
        self.login().await.map(|_| ())
    }

    async fn list_pending_orders(&self, limit: u32, offset: u32) -> Result<Vec<PendingOrder>, ErpError> {
        let query = [
            ("state", "pending".to_string()),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ];
        let resp = self
            .send(|| self.request(Method::GET, "/api/work-orders").query(&query))
            .await?;
        let list: ListResponse<PendingOrder> = Self::decode(resp, "work order list").await?;
        tracing::debug!(count = list.items.len(), limit, offset, "pending work orders fetched");
        Ok(list.items)
    }

    async fn push_consumption(
        &self,
        work_order: &str,
        equipment: &str,
        report: &ConsumptionReport,
    ) -> Result<ConsumptionAck, ErpError> {
        let path = Self::order_path(work_order, "consumption");
        let body = ConsumptionRequest { equipment, report };
        let resp = self
            .send(|| self.request(Method::POST, &path).json(&body))
            .await?;
        Self::decode(resp, "consumption ack").await
    }

    async fn mark_done(&self, work_order: &str, finished_qty: f64) -> Result<(), ErpError> {
        let path = Self::order_path(work_order, "done");
        let body = serde_json::json!({ "finished_quantity": finished_qty });
        self.send(|| self.request(Method::POST, &path).json(&body))
            .await?;
        Ok(())
    }

    async fn cancel_order(&self, work_order: &str) -> Result<(), ErpError> {
        let path = Self::order_path(work_order, "cancel");
        self.send(|| self.request(Method::POST, &path)).await?;
        Ok(())
    }
}
