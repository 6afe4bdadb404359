//! Upstream forwarding for admitted requests.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use reqwest::Client;
use std::sync::Arc;
use tracing::{trace, warn};

use super::middleware::{Unmetered, API_TOKEN_HEADER};
use crate::config::ServerConfig;
use crate::error::{GatewayError, Result};

/// Headers that describe one connection and are never forwarded.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::HOST,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Forwards requests to the protected API and relays its responses.
pub struct UpstreamProxy {
    client: Client,
    base_url: String,
    max_body_bytes: usize,
}

impl UpstreamProxy {
    /// Returns `Ok(None)` when no upstream is configured.
    pub fn from_config(config: &ServerConfig) -> Result<Option<Self>> {
        let Some(upstream) = config.upstream_url.as_deref() else {
            return Ok(None);
        };

        let client = Client::builder()
            .timeout(std::time::Duration::from_millis(config.upstream_timeout_ms))
            .build()?;

        Ok(Some(Self {
            client,
            base_url: upstream.trim_end_matches('/').to_string(),
            max_body_bytes: config.max_body_bytes,
        }))
    }

    async fn forward(&self, request: Request) -> Response {
        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.base_url, path_and_query);

        let body = match axum::body::to_bytes(body, self.max_body_bytes).await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to read request body");
                return unmetered(StatusCode::PAYLOAD_TOO_LARGE.into_response());
            }
        };

        trace!(method = %parts.method, url = %url, "Forwarding request upstream");
        let upstream = self
            .client
            .request(parts.method, &url)
            .headers(forwarded_headers(&parts.headers))
            .body(body)
            .send()
            .await;

        let upstream = match upstream {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(error = %e, url = %url, "Upstream request failed");
                return unmetered(GatewayError::UpstreamUnavailable(e.to_string()).into_response());
            }
        };

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        match upstream.bytes().await {
            Ok(bytes) => {
                let mut response = Response::new(Body::from(bytes));
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            Err(e) => {
                warn!(error = %e, url = %url, "Failed to read upstream response body");
                unmetered(GatewayError::UpstreamUnavailable(e.to_string()).into_response())
            }
        }
    }
}

/// Fallback handler relaying every gated request to the upstream.
pub async fn proxy_handler(State(proxy): State<Arc<UpstreamProxy>>, request: Request) -> Response {
    proxy.forward(request).await
}

fn forwarded_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(&API_TOKEN_HEADER);
    headers
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

fn unmetered(mut response: Response) -> Response {
    response.extensions_mut().insert(Unmetered);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::any;
    use axum::Router;
    use http_body_util::BodyExt;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn spawn_upstream() -> SocketAddr {
        let app = Router::new().route(
            "/{*path}",
            any(|request: Request| async move {
                let echoed_token = request.headers().contains_key("x-api-token");
                let body = format!(
                    "{} {} token={}",
                    request.method(),
                    request.uri(),
                    echoed_token
                );
                (StatusCode::CREATED, [("x-upstream", "yes")], body)
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn proxy_to(upstream_url: String) -> Arc<UpstreamProxy> {
        let config = ServerConfig {
            upstream_url: Some(upstream_url),
            upstream_timeout_ms: 2_000,
            ..Default::default()
        };
        Arc::new(UpstreamProxy::from_config(&config).unwrap().unwrap())
    }

    fn inbound(uri: &str) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("x-api-token", "tok_secret")
            .header("host", "gateway.example")
            .body(Body::from("payload"))
            .unwrap()
    }

    #[test]
    fn test_no_upstream_configured() {
        let proxy = UpstreamProxy::from_config(&ServerConfig::default()).unwrap();
        assert!(proxy.is_none());
    }

    #[test]
    fn test_token_and_hop_headers_not_forwarded() {
        let mut inbound = HeaderMap::new();
        inbound.insert("x-api-token", "tok_secret".parse().unwrap());
        inbound.insert(header::HOST, "gateway.example".parse().unwrap());
        inbound.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        inbound.insert(header::ACCEPT, "application/json".parse().unwrap());

        let forwarded = forwarded_headers(&inbound);
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[header::ACCEPT], "application/json");
    }

    #[tokio::test]
    async fn test_forwards_request_and_relays_response() {
        let addr = spawn_upstream().await;
        let proxy = proxy_to(format!("http://{addr}/"));

        let response = proxy_handler(State(proxy), inbound("/v1/blocks?from=10")).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-upstream"], "yes");
        assert!(response.extensions().get::<Unmetered>().is_none());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"POST /v1/blocks?from=10 token=false");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_unmetered_502() {
        // Reserve a port, then close it so connections are refused
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let proxy = proxy_to(format!("http://{addr}"));
        let response = proxy_handler(State(proxy), inbound("/v1/blocks")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.extensions().get::<Unmetered>().is_some());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "upstream_unavailable");
    }
}
