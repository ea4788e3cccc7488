use axum::{
    extract::{Request, State},
    http::{HeaderValue, header},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Response headers applied to every response leaving the service.
#[derive(Debug, Clone)]
pub struct SecurityHeaders {
    pub content_security_policy: HeaderValue,
    pub frame_options: HeaderValue,
    pub hsts: Option<HeaderValue>,
}

impl Default for SecurityHeaders {
    fn default() -> Self {
        Self {
            content_security_policy: HeaderValue::from_static(
                "default-src 'self'; frame-ancestors 'self'; object-src 'none'",
            ),
            frame_options: HeaderValue::from_static("SAMEORIGIN"),
            hsts: Some(HeaderValue::from_static(
                "max-age=31536000; includeSubDomains",
            )),
        }
    }
}

impl SecurityHeaders {
    /// Strict policy for JSON endpoints that never render into a frame.
    pub fn api() -> Self {
        Self {
            content_security_policy: HeaderValue::from_static(
                "default-src 'none'; frame-ancestors 'none'",
            ),
            frame_options: HeaderValue::from_static("DENY"),
            ..Self::default()
        }
    }

    /// Drop HSTS, for plain-http development setups.
    pub fn without_hsts(mut self) -> Self {
        self.hsts = None;
        self
    }
}

pub async fn security_headers_middleware(
    State(policy): State<Arc<SecurityHeaders>>,
    req: Request,
    next: Next,
) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        policy.content_security_policy.clone(),
    );
    headers.insert(header::X_FRAME_OPTIONS, policy.frame_options.clone());
    if let Some(hsts) = &policy.hsts {
        headers.insert(header::STRICT_TRANSPORT_SECURITY, hsts.clone());
    }

    response
}
