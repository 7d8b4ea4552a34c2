use anyhow::{Context, Result};
use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use reqwest::Client;
use std::net::SocketAddr;
use std::time::Duration;

/// Connection-scoped headers that must not travel across the proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Everything the forwarder needs from an accepted request.
pub struct ForwardRequest<'a> {
    pub method: Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
}

/// Relays accepted requests to the single configured backend.
#[derive(Clone)]
pub struct ProxyClient {
    client: Client,
    backend: url::Url,
}

impl ProxyClient {
    pub fn new(backend: url::Url, timeout_seconds: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to build reqwest client")?;

        Ok(Self { client, backend })
    }

    /// Backend origin path joined with the request path. A backend query is
    /// kept in front of the request's own query.
    pub fn target_url(&self, uri: &Uri) -> String {
        let mut base = self.backend.clone();
        base.set_query(None);
        let base = base.as_str().trim_end_matches('/');

        let query = match (self.backend.query(), uri.query()) {
            (Some(b), Some(r)) if !b.is_empty() && !r.is_empty() => format!("?{}&{}", b, r),
            (Some(b), _) if !b.is_empty() => format!("?{}", b),
            (_, Some(r)) => format!("?{}", r),
            _ => String::new(),
        };
        format!("{}{}{}", base, uri.path(), query)
    }

    /// Forwards the request and streams the backend's answer back. Never
    /// fails: transport problems become 502, timeouts 504.
    pub async fn forward(&self, req: ForwardRequest<'_>) -> Response {
        let url = self.target_url(req.uri);
        let headers = forwarded_headers(req.headers, req.remote_addr);

        let response = match self
            .client
            .request(req.method, &url)
            .headers(headers)
            .body(req.body)
            .send()
            .await
        {
            Ok(resp) => {
                tracing::debug!("Backend responded: {}", resp.status());
                resp
            }
            Err(e) => {
                tracing::error!("Backend request to {} failed: {}", url, e);
                let status = if e.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                };
                return upstream_error(status, &e.to_string());
            }
        };

        // The body is relayed unchanged, so the backend's Content-Length holds.
        let mut builder = Response::builder().status(response.status());
        let connection_listed = connection_tokens(response.headers());
        for (name, value) in response.headers() {
            if is_hop_by_hop(name, &connection_listed) {
                continue;
            }
            builder = builder.header(name, value);
        }

        builder
            .body(Body::from_stream(response.bytes_stream()))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

fn upstream_error(status: StatusCode, details: &str) -> Response {
    let error_json = serde_json::json!({
        "error": "upstream_error",
        "details": details,
    });
    let body = serde_json::to_string(&error_json)
        .unwrap_or_else(|_| "{\"error\": \"upstream_error\"}".to_string());

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| status.into_response())
}

/// Header names listed in `Connection`, lowercased.
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn is_hop_by_hop(name: &HeaderName, connection_listed: &[String]) -> bool {
    let name = name.as_str();
    HOP_BY_HOP.contains(&name) || connection_listed.iter().any(|t| t == name)
}

/// Client headers minus hop-by-hop and `Content-Length`, plus the
/// `X-Forwarded-*` set. The client's `Host` is kept so virtual-host routing on
/// the backend still works.
fn forwarded_headers(incoming: &HeaderMap, remote_addr: Option<SocketAddr>) -> HeaderMap {
    let connection_listed = connection_tokens(incoming);
    let mut out = HeaderMap::with_capacity(incoming.len() + 3);

    for (name, value) in incoming {
        if is_hop_by_hop(name, &connection_listed) || name == header::CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    if let Some(addr) = remote_addr {
        let client_ip = addr.ip().to_string();
        let chain = match incoming
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            Some(prior) if !prior.trim().is_empty() => format!("{}, {}", prior, client_ip),
            _ => client_ip,
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            out.insert("x-forwarded-for", value);
        }
    }

    if let Some(host) = incoming.get(header::HOST) {
        out.insert("x-forwarded-host", host.clone());
    }
    if !out.contains_key("x-forwarded-proto") {
        out.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> ProxyClient {
        ProxyClient::new(url::Url::parse(base).expect("url"), 5).expect("client")
    }

    #[test]
    fn test_target_url_keeps_path_and_query() {
        let proxy = client("http://localhost:3000");
        let uri: Uri = "/upload/a%20b?x=1&y=%2F".parse().expect("uri");
        assert_eq!(proxy.target_url(&uri), "http://localhost:3000/upload/a%20b?x=1&y=%2F");

        let prefixed = client("http://backend:8000/api/");
        let uri: Uri = "/v1/items".parse().expect("uri");
        assert_eq!(prefixed.target_url(&uri), "http://backend:8000/api/v1/items");

        let with_query = client("http://backend:8000/?tenant=a");
        let uri: Uri = "/x?y=1".parse().expect("uri");
        assert_eq!(with_query.target_url(&uri), "http://backend:8000/x?tenant=a&y=1");
    }

    #[test]
    fn test_hop_by_hop_headers_stripped_host_kept() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("app.example"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-secret"));
        headers.insert("x-secret", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        headers.append("x-custom", HeaderValue::from_static("a"));
        headers.append("x-custom", HeaderValue::from_static("b"));

        let out = forwarded_headers(&headers, Some("10.0.0.7:5000".parse().expect("addr")));

        assert_eq!(out[header::HOST], "app.example");
        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get("x-secret").is_none(), "Connection-listed headers are hop-by-hop");
        assert!(out.get(header::TRANSFER_ENCODING).is_none());
        assert!(out.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(out.get_all("x-custom").iter().count(), 2);
        assert_eq!(out["x-forwarded-for"], "10.0.0.7");
        assert_eq!(out["x-forwarded-host"], "app.example");
    }

    #[test]
    fn test_forwarded_for_chain_extended() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));
        let out = forwarded_headers(&headers, Some("10.0.0.7:5000".parse().expect("addr")));
        assert_eq!(out["x-forwarded-for"], "203.0.113.9, 10.0.0.7");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_bad_gateway() {
        let proxy = client("http://127.0.0.1:1");
        let uri: Uri = "/x".parse().expect("uri");
        let headers = HeaderMap::new();
        let response = proxy
            .forward(ForwardRequest {
                method: Method::GET,
                uri: &uri,
                headers: &headers,
                body: Bytes::new(),
                remote_addr: None,
            })
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    }
}
