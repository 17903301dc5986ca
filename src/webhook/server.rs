//! Admission Webhook Server
//!
//! Serves the mutating admission endpoint for Secrets plus health and
//! metrics endpoints. Every review runs the full pipeline: decode, extract
//! the Secret, decrypt enveloped values, diff, respond.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Uri};
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use opentelemetry::{global, propagation::Extractor};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::metrics;
use super::mutation::{MutationEngine, DEFAULT_MAX_IN_FLIGHT};
use super::patch::create_patch;
use super::resource::extract_secret;
use super::review::{decode_review, encode_review, ReviewRequest, ReviewResponse};
use crate::error::{Error, Result};
use crate::kms::DecryptionBackend;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8083";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

struct HeaderExtractor<'a>(&'a HeaderMap);

impl<'a> Extractor for HeaderExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v: &HeaderValue| v.to_str().ok())
    }
    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k: &HeaderName| k.as_str()).collect()
    }
}

async fn extract_trace_context(request: Request, next: Next) -> Response {
    let parent_cx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(request.headers()))
    });
    tracing::Span::current().set_parent(parent_cx);
    next.run(request).await
}

/// TLS material for the listener
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// When set, clients must present a certificate signed by this CA
    pub client_ca_path: Option<PathBuf>,
}

/// Webhook server configuration
#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub listen_addr: SocketAddr,
    pub tls: Option<TlsConfig>,
    pub request_timeout: Duration,
    pub max_in_flight: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8083)),
            tls: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

/// Shared, read-only state of the webhook
pub struct WebhookState {
    engine: MutationEngine,
}

impl WebhookState {
    pub fn new(engine: MutationEngine) -> Self {
        Self { engine }
    }

    /// Handle one serialized review and return the serialized response.
    ///
    /// Errors returned here are protocol failures; request scoped failures
    /// become a denied response instead.
    pub async fn review(&self, body: &[u8], content_type: Option<&str>) -> Result<Vec<u8>> {
        let (request, version) = decode_review(body, content_type)?;

        let response = match self.admit(&request).await {
            Ok(patch) => ReviewResponse::allowed(request.uid.as_str(), &patch)?,
            Err(err) if !err.is_protocol_error() => {
                warn!(
                    uid = %request.uid,
                    kind = err.kind(),
                    error = %err,
                    "Denying admission request"
                );
                ReviewResponse::denied(request.uid.as_str(), &err)
            }
            Err(err) => return Err(err),
        };

        let outcome = response.outcome();
        let body = encode_review(response, version)?;
        metrics::record_admission_outcome(outcome);
        Ok(body)
    }

    #[instrument(
        skip(self, request),
        fields(
            uid = %request.uid,
            namespace = request.namespace.as_deref().unwrap_or_default(),
            name = %request.name,
            operation = ?request.operation,
        )
    )]
    async fn admit(&self, request: &ReviewRequest) -> Result<json_patch::Patch> {
        let target = extract_secret(request)?;
        let mutation = self.engine.mutate(&target).await?;

        let after = target.render(&mutation.replaced)?;
        let patch = create_patch(target.document(), &after);

        info!(
            decrypted = ?mutation.decrypted_keys().collect::<Vec<_>>(),
            operations = patch.0.len(),
            dry_run = request.dry_run,
            "Mutated secret"
        );
        Ok(patch)
    }
}

/// Build the webhook router.
pub fn router(state: Arc<WebhookState>, request_timeout: Duration) -> Router {
    Router::new()
        .route("/secrets", post(mutate_handler))
        .route("/mutate", post(mutate_handler))
        .route("/healthz", get(health_handler))
        .route("/readyz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(extract_trace_context))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(request_timeout)),
        )
        .with_state(state)
}

/// Serve the webhook until SIGINT/SIGTERM.
pub async fn serve(config: WebhookConfig, backend: Arc<dyn DecryptionBackend>) -> Result<()> {
    let engine = MutationEngine::new(backend).with_max_in_flight(config.max_in_flight);
    let state = Arc::new(WebhookState::new(engine));
    let app = router(state, config.request_timeout);
    let addr = config.listen_addr;

    if let Some(tls) = &config.tls {
        let rustls_config = load_tls_config(tls).await?;
        info!(
            "Starting webhook server on {} with TLS (client auth: {})",
            addr,
            tls.client_ca_path.is_some()
        );

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });

        axum_server::bind_rustls(addr, rustls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        warn!("Starting webhook server on {} without TLS", addr);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    }

    info!("Webhook server stopped");
    Ok(())
}

async fn load_tls_config(tls: &TlsConfig) -> Result<RustlsConfig> {
    // Several crypto backends may be linked; pin one for the process.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cert_pem = tokio::fs::read(&tls.cert_path).await?;
    let key_pem = tokio::fs::read(&tls.key_path).await?;

    let certs = CertificateDer::pem_slice_iter(&cert_pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::ConfigError(format!("Failed to parse certificates: {e}")))?;
    let key = PrivateKeyDer::from_pem_slice(&key_pem)
        .map_err(|e| Error::ConfigError(format!("Failed to parse private key: {e}")))?;

    let builder = rustls::ServerConfig::builder();
    let mut server_config = match &tls.client_ca_path {
        Some(ca_path) => {
            let ca_pem = tokio::fs::read(ca_path).await?;
            let mut roots = RootCertStore::empty();
            for cert_res in CertificateDer::pem_slice_iter(&ca_pem) {
                let cert = cert_res
                    .map_err(|e| Error::ConfigError(format!("Failed to parse CA cert: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| Error::ConfigError(format!("Failed to add CA cert: {e}")))?;
            }
            let client_verifier = WebPkiClientVerifier::builder(roots.into())
                .build()
                .map_err(|e| {
                    Error::ConfigError(format!("Failed to create client verifier: {e}"))
                })?;
            builder
                .with_client_cert_verifier(client_verifier)
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .map_err(|e| Error::ConfigError(format!("Failed to create server config: {e}")))?;
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(RustlsConfig::from_config(Arc::new(server_config)))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

// HTTP Handlers

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

async fn metrics_handler() -> Response {
    match metrics::render() {
        Ok(body) => body.into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    debug!(path = uri.path(), bytes = body.len(), "Received admission review");

    let response = match state.review(&body, content_type).await {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            body,
        )
            .into_response(),
        Err(err) => {
            metrics::record_admission_outcome("error");
            internal_error(uri.path(), &err)
        }
    };
    metrics::observe_admission_duration(started.elapsed().as_secs_f64());
    response
}

fn internal_error(path: &str, err: &Error) -> Response {
    error!(path, kind = err.kind(), error = %err, "Failed to handle admission review");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        )],
        format!("Internal Server Error: {path:?}: {err}\n"),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::kms::BackendError;
    use async_trait::async_trait;
    use axum::body::Body;
    use base64::Engine;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    struct NeverBackend;

    #[async_trait]
    impl DecryptionBackend for NeverBackend {
        async fn decrypt(&self, _envelope: &Envelope) -> Result<Vec<u8>, BackendError> {
            Err(BackendError::Unavailable("not wired".to_string()))
        }
    }

    fn app() -> Router {
        let state = Arc::new(WebhookState::new(MutationEngine::new(Arc::new(NeverBackend))));
        router(state, DEFAULT_REQUEST_TIMEOUT)
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        for path in ["/healthz", "/readyz"] {
            let response = app()
                .oneshot(axum::http::Request::builder().uri(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            assert_eq!(&body[..], br#"{"status":"ok"}"#);
        }
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = app()
            .oneshot(axum::http::Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unsupported_media_type_is_500() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/secrets")
                    .header(CONTENT_TYPE, "text/plain")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(
            String::from_utf8_lossy(&body).trim_end(),
            r#"Internal Server Error: "/secrets": contentType=text/plain, expect application/json"#
        );
    }

    /// Sleeps past the request deadline and counts decrypts that finish.
    struct SlowBackend {
        delay: Duration,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DecryptionBackend for SlowBackend {
        async fn decrypt(&self, _envelope: &Envelope) -> Result<Vec<u8>, BackendError> {
            tokio::time::sleep(self.delay).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(b"plaintext".to_vec())
        }
    }

    #[tokio::test]
    async fn test_request_timeout_drops_inflight_decrypts() {
        let finished = Arc::new(AtomicUsize::new(0));
        let backend = SlowBackend {
            delay: Duration::from_millis(500),
            finished: finished.clone(),
        };
        let state = Arc::new(WebhookState::new(MutationEngine::new(Arc::new(backend))));
        let app = router(state, Duration::from_millis(50));

        let envelope = "eyJhbGciOiJSU0EtT0FFUC0yNTYiLCJlbmMiOiJBMjU2R0NNIn0.a2V5.aXY.Y3Q.dGFn";
        let review = serde_json::json!({
            "kind": "AdmissionReview",
            "apiVersion": "admission.k8s.io/v1",
            "request": {
                "uid": "slow",
                "kind": {"group": "", "version": "v1", "kind": "Secret"},
                "resource": {"group": "", "version": "v1", "resource": "secrets"},
                "operation": "CREATE",
                "object": {
                    "apiVersion": "v1",
                    "kind": "Secret",
                    "metadata": {"name": "db", "namespace": "default"},
                    "data": {
                        "a": base64::engine::general_purpose::STANDARD.encode(envelope),
                        "b": base64::engine::general_purpose::STANDARD.encode(envelope)
                    }
                }
            }
        });

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/secrets")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(serde_json::to_vec(&review).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_default_config() {
        let config = WebhookConfig::default();
        assert_eq!(config.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert!(config.tls.is_none());
        assert_eq!(config.max_in_flight, DEFAULT_MAX_IN_FLIGHT);
    }
}
