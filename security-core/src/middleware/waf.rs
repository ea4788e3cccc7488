use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{FromRequest, Multipart, Request, State},
    http::{header, request::Parts, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::context::RequestContext;
use crate::waf::{decode::percent_decode, Firewall, ScanInput, Verdict, WAF_TARGET};

/// Negotiation headers skipped by the scan. Cookies are scanned one by one.
const HEADER_ALLOWLIST: [&str; 6] = [
    "host",
    "connection",
    "accept",
    "accept-language",
    "accept-encoding",
    "cookie",
];

/// Inspect URI, query, headers, cookies, textual bodies and multipart text
/// fields before anything else runs.
pub async fn waf_middleware(
    State(firewall): State<Firewall>,
    req: Request,
    next: Next,
) -> Response {
    if !firewall.config().enabled {
        return next.run(req).await;
    }

    let ctx = RequestContext::from_request(&req);
    let (parts, body) = req.into_parts();
    let mut inputs = collect_inputs(&parts);

    let req = if inspects_body(&parts) {
        let bytes = match to_bytes(body, firewall.config().max_body_bytes).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(target: WAF_TARGET, error = %e, ip = %ctx.ip_address, "Request body over inspection limit");
                return (StatusCode::PAYLOAD_TOO_LARGE, "Payload too large").into_response();
            }
        };
        collect_body(&parts, &bytes, &mut inputs).await;
        Request::from_parts(parts, Body::from(bytes))
    } else {
        Request::from_parts(parts, body)
    };

    match firewall.inspect(&ctx, &inputs).await {
        Verdict::Allow => next.run(req).await,
        Verdict::Block { reference, .. } => blocked_response(&reference),
    }
}

/// Generic 403. The matched family is never disclosed.
pub fn blocked_response(reference: &str) -> Response {
    (
        StatusCode::FORBIDDEN,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("403 Forbidden\nReference: {}\n", reference),
    )
        .into_response()
}

fn collect_inputs(parts: &Parts) -> Vec<ScanInput> {
    let mut inputs = vec![ScanInput::new("uri", parts.uri.path())];

    if let Some(query) = parts.uri.query() {
        push_pairs(&mut inputs, "get", query);
    }

    for (name, value) in parts.headers.iter() {
        if HEADER_ALLOWLIST.contains(&name.as_str()) {
            continue;
        }
        let value = String::from_utf8_lossy(value.as_bytes());
        inputs.push(ScanInput::new(format!("header:{}", name), value));
    }

    for cookie_header in parts.headers.get_all(header::COOKIE) {
        let raw = String::from_utf8_lossy(cookie_header.as_bytes());
        for pair in raw.split(';') {
            let (name, value) = pair.trim().split_once('=').unwrap_or((pair.trim(), ""));
            if name.is_empty() {
                continue;
            }
            inputs.push(ScanInput::new(format!("cookie:{}", name), value));
        }
    }

    inputs
}

/// Split raw `a=b&c=d` without decoding the values, so the scan decodes
/// them exactly once.
fn push_pairs(inputs: &mut Vec<ScanInput>, prefix: &str, raw: &str) {
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = key.replace('+', " ");
        let source = format!("{}:{}", prefix, percent_decode(&key));
        inputs.push(ScanInput::new(source.clone(), key));
        inputs.push(ScanInput::new(source, value.replace('+', " ")));
    }
}

fn content_type(parts: &Parts) -> &str {
    parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Textual bodies and multipart forms. File parts of a multipart form are
/// left to the upload checks.
fn inspects_body(parts: &Parts) -> bool {
    let content_type = content_type(parts).to_ascii_lowercase();
    content_type.starts_with("application/x-www-form-urlencoded")
        || content_type.starts_with("multipart/form-data")
        || content_type.starts_with("application/json")
        || content_type.starts_with("application/xml")
        || content_type.starts_with("text/")
}

async fn collect_body(parts: &Parts, bytes: &Bytes, inputs: &mut Vec<ScanInput>) {
    if bytes.is_empty() {
        return;
    }
    let content_type = content_type(parts).to_ascii_lowercase();
    let text = String::from_utf8_lossy(bytes);

    if content_type.starts_with("application/x-www-form-urlencoded") {
        push_pairs(inputs, "post", &text);
    } else if content_type.starts_with("multipart/form-data") {
        if let Err(e) = push_multipart(inputs, parts, bytes.clone()).await {
            // Unparseable forms are scanned as one opaque body.
            tracing::debug!(target: WAF_TARGET, error = %e, "Malformed multipart body");
            inputs.push(ScanInput::new("body", text));
        }
    } else if content_type.starts_with("application/json") {
        match serde_json::from_slice::<serde_json::Value>(bytes) {
            Ok(value) => push_json(inputs, "json:", &value),
            Err(_) => inputs.push(ScanInput::new("body", text)),
        }
    } else {
        inputs.push(ScanInput::new("body", text));
    }
}

/// Text parts become `post:<name>` inputs; parts carrying a filename are
/// skipped. The boundary is read from the original `Content-Type`.
async fn push_multipart(
    inputs: &mut Vec<ScanInput>,
    parts: &Parts,
    bytes: Bytes,
) -> Result<(), anyhow::Error> {
    let req = axum::http::Request::builder()
        .header(header::CONTENT_TYPE, content_type(parts))
        .body(Body::from(bytes))?;
    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|e| anyhow::anyhow!(e.body_text()))?;

    while let Some(field) = multipart.next_field().await? {
        if field.file_name().is_some() {
            continue;
        }
        let name = field.name().unwrap_or_default().to_string();
        let value = field.text().await?;
        let source = format!("post:{}", name);
        inputs.push(ScanInput::new(source.clone(), name));
        inputs.push(ScanInput::new(source, value));
    }
    Ok(())
}

fn push_json(inputs: &mut Vec<ScanInput>, path: &str, value: &serde_json::Value) {
    match value {
        serde_json::Value::String(s) => inputs.push(ScanInput::new(path, s.as_str())),
        serde_json::Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                push_json(inputs, &format!("{}/{}", path, i), item);
            }
        }
        serde_json::Value::Object(map) => {
            for (key, item) in map {
                let child = format!("{}/{}", path, key);
                inputs.push(ScanInput::new(child.clone(), key.as_str()));
                push_json(inputs, &child, item);
            }
        }
        _ => {}
    }
}
