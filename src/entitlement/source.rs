//! Source-of-truth client for entitlements and usage.
//!
//! The gateway never writes balances to the source of truth on the hot path.
//! It bulk-loads entitlements into the cache and ships aggregated usage back
//! through [`SourceOfTruth::apply_usage`].

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::BillingConfig;
use crate::error::{GatewayError, Result};
use crate::sync::UsageBatch;

/// Coarse tier attached to a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AccessLevel {
    /// No usable token; limited by client IP
    Unauthenticated = 0,
    /// Admin token; never throttled, never charged
    Unrestricted = 1,
    /// Metered token; limited by token and charged per request
    Metered = 2,
}

impl TryFrom<u8> for AccessLevel {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(AccessLevel::Unauthenticated),
            1 => Ok(AccessLevel::Unrestricted),
            2 => Ok(AccessLevel::Metered),
            other => Err(format!("unknown access level {}", other)),
        }
    }
}

impl From<AccessLevel> for u8 {
    fn from(level: AccessLevel) -> Self {
        level as u8
    }
}

/// One token's entitlement as reported by the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntitlement {
    pub token: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    pub access_level: AccessLevel,
    pub credit_balance: u64,
}

/// Trait for the authoritative store of tokens, balances and usage.
///
/// This abstracts over the HTTP billing backend so that the cache and the
/// sync manager can run against an in-memory fake in tests.
#[async_trait]
pub trait SourceOfTruth: Send + Sync {
    /// Load every known token's entitlement.
    async fn bulk_load_entitlements(&self) -> Result<Vec<TokenEntitlement>>;

    /// Apply a batch of usage deltas. Batches carry a unique id so the
    /// backend can discard duplicates.
    async fn apply_usage(&self, batch: &UsageBatch) -> Result<()>;
}

/// HTTP implementation of [`SourceOfTruth`].
pub struct HttpSourceOfTruth {
    client: Client,
    endpoint: String,
    service_token: Option<SecretString>,
}

impl HttpSourceOfTruth {
    /// Create a new client from the billing configuration.
    pub fn new(config: &BillingConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| GatewayError::Config("billing.endpoint is not set".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            endpoint,
            service_token: config.service_token.clone(),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.service_token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }
}

#[async_trait]
impl SourceOfTruth for HttpSourceOfTruth {
    async fn bulk_load_entitlements(&self) -> Result<Vec<TokenEntitlement>> {
        let url = format!("{}/entitlements", self.endpoint);
        trace!(url = %url, "Loading entitlements");

        let entitlements: Vec<TokenEntitlement> = self
            .authorize(self.client.get(&url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!(count = entitlements.len(), "Loaded entitlements from source of truth");
        Ok(entitlements)
    }

    async fn apply_usage(&self, batch: &UsageBatch) -> Result<()> {
        let url = format!("{}/usage", self.endpoint);
        trace!(url = %url, batch_id = %batch.batch_id, "Sending usage batch");

        self.authorize(self.client.post(&url))
            .header("Idempotency-Key", batch.batch_id.to_string())
            .json(batch)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::UsageRecord;
    use axum::extract::{Request, State};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::{Json, Router};
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    #[derive(Debug, Clone)]
    struct SeenRequest {
        method: String,
        path: String,
        authorization: Option<String>,
        idempotency_key: Option<String>,
        body: Vec<u8>,
    }

    type Seen = Arc<Mutex<Vec<SeenRequest>>>;

    async fn billing_backend(State(seen): State<Seen>, request: Request) -> Response {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .map(|value| value.to_str().unwrap().to_string())
        };
        seen.lock().push(SeenRequest {
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            authorization: header("authorization"),
            idempotency_key: header("idempotency-key"),
            body: body.to_vec(),
        });

        match (parts.method.as_str(), parts.uri.path()) {
            ("GET", "/api/entitlements") => Json(serde_json::json!([
                {"token": "tok_1", "owner_id": "acct_9", "access_level": 2, "credit_balance": 40},
                {"token": "tok_admin", "access_level": 1, "credit_balance": 0}
            ]))
            .into_response(),
            ("POST", "/api/usage") => StatusCode::ACCEPTED.into_response(),
            _ => StatusCode::NOT_FOUND.into_response(),
        }
    }

    async fn spawn_backend(app: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn client_for(addr: SocketAddr) -> HttpSourceOfTruth {
        HttpSourceOfTruth::new(&BillingConfig {
            endpoint: Some(format!("http://{addr}/api/")),
            service_token: Some(SecretString::from("svc_secret".to_string())),
            ..Default::default()
        })
        .unwrap()
    }

    fn batch() -> UsageBatch {
        UsageBatch {
            batch_id: Uuid::new_v4(),
            created_at: Utc::now(),
            records: vec![UsageRecord {
                token: "tok_1".to_string(),
                new_requests: 3,
                credits_consumed: 12,
            }],
        }
    }

    #[tokio::test]
    async fn test_http_client_loads_entitlements() {
        let seen = Seen::default();
        let addr = spawn_backend(Router::new().fallback(billing_backend).with_state(seen.clone())).await;
        let client = client_for(addr);

        let entitlements = client.bulk_load_entitlements().await.unwrap();
        assert_eq!(entitlements.len(), 2);
        assert_eq!(entitlements[0].owner_id.as_deref(), Some("acct_9"));
        assert_eq!(entitlements[0].access_level, AccessLevel::Metered);
        assert_eq!(entitlements[1].access_level, AccessLevel::Unrestricted);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, "GET");
        assert_eq!(seen[0].path, "/api/entitlements");
        assert_eq!(seen[0].authorization.as_deref(), Some("Bearer svc_secret"));
    }

    #[tokio::test]
    async fn test_http_client_posts_usage_with_idempotency_key() {
        let seen = Seen::default();
        let addr = spawn_backend(Router::new().fallback(billing_backend).with_state(seen.clone())).await;
        let client = client_for(addr);
        let batch = batch();

        client.apply_usage(&batch).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let request = &seen[0];
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/api/usage");
        assert_eq!(request.authorization.as_deref(), Some("Bearer svc_secret"));
        assert_eq!(request.idempotency_key, Some(batch.batch_id.to_string()));

        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["batch_id"], batch.batch_id.to_string());
        assert!(body["created_at"].is_string());
        assert_eq!(body["records"][0]["token"], "tok_1");
        assert_eq!(body["records"][0]["new_requests"], 3);
        assert_eq!(body["records"][0]["credits_consumed"], 12);
    }

    #[tokio::test]
    async fn test_http_client_error_status_is_failure() {
        let addr = spawn_backend(
            Router::new().fallback(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        )
        .await;
        let client = client_for(addr);

        assert!(matches!(
            client.bulk_load_entitlements().await,
            Err(GatewayError::Http(_))
        ));
        assert!(matches!(client.apply_usage(&batch()).await, Err(GatewayError::Http(_))));
    }

    #[test]
    fn test_access_level_from_wire() {
        let parsed: TokenEntitlement = serde_json::from_str(
            r#"{"token":"tok_1","access_level":2,"credit_balance":40}"#,
        )
        .unwrap();
        assert_eq!(parsed.access_level, AccessLevel::Metered);
        assert_eq!(parsed.owner_id, None);
        assert_eq!(parsed.credit_balance, 40);
    }

    #[test]
    fn test_unknown_access_level_rejected() {
        let parsed = serde_json::from_str::<TokenEntitlement>(
            r#"{"token":"tok_1","access_level":7,"credit_balance":0}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_http_client_requires_endpoint() {
        let result = HttpSourceOfTruth::new(&BillingConfig::default());
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_http_client_trims_endpoint() {
        let config = BillingConfig {
            endpoint: Some("http://billing.internal/api/".to_string()),
            ..Default::default()
        };
        let client = HttpSourceOfTruth::new(&config).unwrap();
        assert_eq!(client.endpoint, "http://billing.internal/api");
    }
}
