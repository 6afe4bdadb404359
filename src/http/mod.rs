//! HTTP surface of the gateway.

mod middleware;
mod proxy;
mod server;

pub use middleware::{
    gateway_middleware, GatewayState, Unmetered, ACCESS_LEVEL_HEADER, API_TOKEN_HEADER,
    CREDITS_REMAINING_HEADER,
};
pub use proxy::{proxy_handler, UpstreamProxy};
pub use server::{gateway_router, HttpServer, HEALTH_PATH};
