use anyhow::Context;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::build_loggers;
use crate::banner;
use crate::config::Config;
use crate::detector::build_detectors;
use crate::pipeline::{FormLimits, Interceptor};
use crate::proxy::ProxyClient;
use crate::security::{PolicyEngine, SignatureEngine};
use crate::sink::ArtifactSink;
use crate::storage::build_uploader;

/// Builds every capability from configuration. Fails when the policy engine
/// or the uploader cannot be constructed; the gateway never runs without them.
pub async fn build_interceptor(config: &Config) -> anyhow::Result<Interceptor> {
    let engine = SignatureEngine::from_file(&config.waf.directives_path).with_context(|| {
        format!(
            "Failed to initialise policy engine from {}",
            config.waf.directives_path
        )
    })?;
    banner::print_success(&format!(
        "Policy engine ready: {} signatures, mode {:?}",
        engine.rule_count(),
        engine.mode()
    ));

    let uploader = build_uploader(&config.uploader)
        .await
        .context("Failed to initialise uploader")?;
    let loggers = build_loggers(&config.logger).await;
    let sink = ArtifactSink::new(
        uploader,
        loggers,
        Duration::from_secs(config.sink.task_timeout_seconds),
    );

    let proxy = ProxyClient::new(config.backend_url()?, config.server.backend_timeout_seconds)?;
    let limits = FormLimits {
        max_part_bytes: config.detectors.max_part_bytes,
    };

    Ok(Interceptor::new(
        build_detectors(&config.detectors),
        Arc::new(sink),
        Arc::new(engine),
        proxy,
        limits,
        config.server.max_body_bytes,
    ))
}

/// Every method and path goes through the interceptor.
pub fn router(interceptor: Arc<Interceptor>) -> Router {
    Router::new().fallback(intercept).with_state(interceptor)
}

async fn intercept(State(interceptor): State<Arc<Interceptor>>, req: Request) -> Response {
    interceptor.handle(req).await
}

pub async fn start_server(
    config: Config,
    shutdown_token: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let addr = config.listen_addr()?;
    let interceptor = build_interceptor(&config).await?;

    banner::print_startup_info(
        &addr.to_string(),
        &config.server.backend_url,
        &config.waf.directives_path,
        &format!("{:?}", config.uploader.kind),
    );

    let app = router(Arc::new(interceptor));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("Gateway listening on {}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
            banner::print_success("Shutdown signal received. Closing gateway...");
            tracing::info!("Gateway shutting down gracefully");
        })
        .await?;

    Ok(())
}
