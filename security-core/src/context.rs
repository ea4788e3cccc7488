//! Per-request ambient data consumed by the audit log and the firewall.

use axum::extract::{ConnectInfo, Request};
use axum::http::{header, HeaderMap, Method, Uri};
use service_core::middleware::RequestId;
use std::net::{IpAddr, SocketAddr};

/// Placeholder when no address can be determined.
pub const UNKNOWN_IP: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub uri: String,
    pub method: String,
    pub request_id: Option<String>,
}

impl RequestContext {
    pub fn from_parts(
        headers: &HeaderMap,
        method: &Method,
        uri: &Uri,
        socket: Option<SocketAddr>,
    ) -> Self {
        Self {
            ip_address: client_ip(headers, socket),
            user_agent: headers
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            uri: uri.to_string(),
            method: method.to_string(),
            request_id: None,
        }
    }

    pub fn from_request(req: &Request) -> Self {
        let socket = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        let mut ctx = Self::from_parts(req.headers(), req.method(), req.uri(), socket);
        ctx.request_id = req.extensions().get::<RequestId>().map(|id| id.0.clone());
        ctx
    }

    /// Context for work not triggered by a request (CLI, background jobs).
    pub fn system(operation: &str) -> Self {
        Self {
            ip_address: "127.0.0.1".to_string(),
            user_agent: None,
            uri: operation.to_string(),
            method: "SYSTEM".to_string(),
            request_id: None,
        }
    }
}

/// Resolve the client address by header priority: Cloudflare, first
/// `X-Forwarded-For` hop, `X-Real-IP`, then the socket peer.
pub fn client_ip(headers: &HeaderMap, socket: Option<SocketAddr>) -> String {
    let header_ip = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .map(str::trim)
            .and_then(|s| s.parse::<IpAddr>().ok())
    };

    header_ip("cf-connecting-ip")
        .or_else(|| header_ip("x-forwarded-for"))
        .or_else(|| header_ip("x-real-ip"))
        .or_else(|| socket.map(|addr| addr.ip()))
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}
