//! Gateway stage wrapped around every gated route.
//!
//! The stage admits the request, runs the credit pre-check, lets the inner
//! handler produce a response, then settles the request's cost exactly once
//! before the response leaves the gateway.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use std::any::Any;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, instrument};

use crate::entitlement::EntitlementCache;
use crate::error::GatewayError;
use crate::ledger::{CreditLedger, RequestContext, Settlement};
use crate::ratelimit::AdmissionController;
use crate::sync::BatchSyncManager;

/// Header carrying the caller's API token.
pub const API_TOKEN_HEADER: HeaderName = HeaderName::from_static("x-api-token");

/// Response header with the numeric access level the request was admitted at.
pub const ACCESS_LEVEL_HEADER: HeaderName = HeaderName::from_static("x-access-level");

/// Response header with the metered token's cached balance after settlement.
pub const CREDITS_REMAINING_HEADER: HeaderName = HeaderName::from_static("x-credits-remaining");

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Response extension marking a gateway-generated response that must not be
/// charged, such as a failed upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unmetered;

/// Shared components the gateway stage and the health route work against.
#[derive(Clone)]
pub struct GatewayState {
    pub admission: Arc<AdmissionController>,
    pub ledger: Arc<CreditLedger>,
    pub cache: Arc<EntitlementCache>,
    pub usage: BatchSyncManager,
    /// Use the first `X-Forwarded-For` hop as the client IP
    pub trust_forwarded_for: bool,
}

/// Admission, credit pre-check and settlement around the inner handler.
#[instrument(
    skip_all,
    fields(method = %request.method(), path = %request.uri().path())
)]
pub async fn gateway_middleware(
    State(state): State<GatewayState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = api_token(&request);
    let client_ip = client_ip(&request, state.trust_forwarded_for);
    let route = request.uri().path().to_string();

    let mut ctx = match state.admission.admit(token.as_deref(), client_ip).await {
        Ok(ctx) => ctx,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = state.ledger.check_credits(&mut ctx) {
        return e.into_response();
    }

    request.extensions_mut().insert(ctx.clone());
    let mut response = match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            error!(panic = %panic_message(&*panic), "Handler panicked, request not charged");
            let mut response = GatewayError::Internal("handler panicked".to_string()).into_response();
            let remaining = current_balance(&state, &ctx);
            annotate(&mut response, &ctx, remaining);
            return response;
        }
    };

    if response.extensions().get::<Unmetered>().is_some() {
        debug!(status = %response.status(), "Gateway-generated response, not charged");
        let remaining = current_balance(&state, &ctx);
        annotate(&mut response, &ctx, remaining);
        return response;
    }

    let remaining = match state.ledger.settle(&mut ctx, &route) {
        Ok(Settlement::Charged { remaining, .. }) => Some(remaining),
        Ok(Settlement::AlreadySettled) => current_balance(&state, &ctx),
        Ok(Settlement::Unmetered) => None,
        Err(e) => return e.into_response(),
    };
    annotate(&mut response, &ctx, remaining);
    response
}

fn api_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(&API_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Resolve the client IP from the connection, or from `X-Forwarded-For`
/// when the gateway sits behind a trusted proxy.
fn client_ip(request: &Request, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get(FORWARDED_FOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|hop| hop.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn current_balance(state: &GatewayState, ctx: &RequestContext) -> Option<u64> {
    if !ctx.is_metered() {
        return None;
    }
    ctx.api_token
        .as_deref()
        .and_then(|token| state.ledger.balance(token))
}

fn annotate(response: &mut Response, ctx: &RequestContext, remaining: Option<u64>) {
    let headers = response.headers_mut();
    headers.insert(
        ACCESS_LEVEL_HEADER,
        HeaderValue::from(u32::from(u8::from(ctx.access_level))),
    );
    if let Some(remaining) = remaining {
        headers.insert(CREDITS_REMAINING_HEADER, HeaderValue::from(remaining));
    }
}
