//! Request interception pipeline.
//!
//! For every request: buffer the body once, run the detectors, hand any
//! artifacts to the sink without waiting on it, drive a policy transaction,
//! then either block or forward to the backend.

pub mod capture;

pub use capture::{CapturedRequest, FormLimits};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::response::{IntoResponse, Response};
use http::{header, StatusCode};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use crate::detector::{Detector, ExtractedArtifact};
use crate::proxy::{ForwardRequest, ProxyClient};
use crate::security::{inspect, PolicyEngine, SecurityDecision, TransactionInput};
use crate::sink::{ArtifactSink, RequestMeta};

pub const BLOCK_BODY: &str = "Request blocked by WAF\n";

pub struct Interceptor {
    detectors: Vec<Box<dyn Detector>>,
    sink: Arc<ArtifactSink>,
    engine: Arc<dyn PolicyEngine>,
    proxy: ProxyClient,
    limits: FormLimits,
    max_body_bytes: usize,
}

impl Interceptor {
    pub fn new(
        detectors: Vec<Box<dyn Detector>>,
        sink: Arc<ArtifactSink>,
        engine: Arc<dyn PolicyEngine>,
        proxy: ProxyClient,
        limits: FormLimits,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            detectors,
            sink,
            engine,
            proxy,
            limits,
            max_body_bytes,
        }
    }

    /// Handles one request end to end. Always produces a response.
    pub async fn handle(&self, req: http::Request<Body>) -> Response {
        let request_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "request",
            request_id = %request_id,
            method = %req.method(),
            path = %req.uri().path()
        );
        self.intercept(req, request_id).instrument(span).await
    }

    async fn intercept(&self, req: http::Request<Body>, request_id: String) -> Response {
        let started = std::time::Instant::now();
        let remote_addr = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let (parts, body) = req.into_parts();

        let body = match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                tracing::warn!("Request body exceeds {} bytes", self.max_body_bytes);
                return plain(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large\n");
            }
            Err(e) => {
                tracing::warn!("Failed to read request body: {}", e);
                return plain(StatusCode::BAD_REQUEST, "Failed to read request body\n");
            }
        };

        let captured = CapturedRequest::new(parts, body, remote_addr, self.limits);

        let artifacts = self.detect(&captured).await;
        if !artifacts.is_empty() {
            tracing::info!("Extracted {} artifact(s)", artifacts.len());
            self.sink.dispatch(&request_meta(&captured, &request_id), artifacts);
        }

        let decision = inspect(
            Arc::clone(&self.engine),
            TransactionInput::from_request(&captured, &request_id),
            captured.body(),
        )
        .await;

        let response = match decision {
            SecurityDecision::Block { .. } => plain(StatusCode::FORBIDDEN, BLOCK_BODY),
            SecurityDecision::Pass => {
                self.proxy
                    .forward(ForwardRequest {
                        method: captured.method().clone(),
                        uri: captured.uri(),
                        headers: captured.headers(),
                        body: captured.body(),
                        remote_addr,
                    })
                    .await
            }
        };

        tracing::info!(
            "{} {} -> {} in {:?}",
            captured.method(),
            captured.path(),
            response.status(),
            started.elapsed()
        );
        response
    }

    /// Runs each detector in order. A failing detector is logged and skipped.
    async fn detect(&self, captured: &CapturedRequest) -> Vec<ExtractedArtifact> {
        let mut artifacts = Vec::new();
        for detector in &self.detectors {
            match detector.detect(captured).await {
                Ok(found) => artifacts.extend(found),
                Err(e) => tracing::warn!("Detector `{}` failed: {}", detector.name(), e),
            }
        }
        artifacts
    }
}

fn request_meta(captured: &CapturedRequest, request_id: &str) -> RequestMeta {
    RequestMeta {
        request_id: request_id.to_string(),
        host: captured.host(),
        path: captured.path().to_string(),
        method: captured.method().to_string(),
        remote_addr: captured
            .remote_addr()
            .map(|a| a.to_string())
            .unwrap_or_default(),
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}
