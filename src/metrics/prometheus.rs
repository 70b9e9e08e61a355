//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, CounterVec, Encoder,
    HistogramVec, IntCounter, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::admission;

lazy_static::lazy_static! {
    /// Total number of reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "backup_restore_operator_reconciliations_total",
        "Total number of reconciliations",
        &["kind"]
    ).unwrap();

    /// Total number of reconciliation errors
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "backup_restore_operator_reconciliation_errors_total",
        "Total number of reconciliation errors",
        &["kind"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "backup_restore_operator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// RestoreSession phase transitions
    pub static ref PHASE_TRANSITIONS: CounterVec = register_counter_vec!(
        "backup_restore_operator_restore_session_phase_transitions_total",
        "Total number of RestoreSession phase transitions by target phase",
        &["phase"]
    ).unwrap();

    /// Restore jobs created
    pub static ref JOBS_CREATED: CounterVec = register_counter_vec!(
        "backup_restore_operator_jobs_created_total",
        "Total number of restore jobs created by variant",
        &["variant"]
    ).unwrap();

    /// Notifications delivered to workload controllers
    pub static ref WORKLOAD_NOTIFICATIONS: CounterVec = register_counter_vec!(
        "backup_restore_operator_workload_notifications_total",
        "Total number of init-container inject/retract notifications",
        &["action"]
    ).unwrap();

    /// Sessions no longer retried after repeated failures
    pub static ref RETRIES_DROPPED: IntCounter = register_int_counter!(
        "backup_restore_operator_retries_dropped_total",
        "Total number of sessions dropped after exhausting retries"
    ).unwrap();

    /// Total number of cleanup operations
    pub static ref CLEANUPS: IntCounter = register_int_counter!(
        "backup_restore_operator_cleanups_total",
        "Total number of RestoreSession cleanups"
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: prometheus::Gauge = prometheus::register_gauge!(
        "backup_restore_operator_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Start the metrics, probe and admission HTTP server
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    // Set initial health
    OPERATOR_HEALTH.set(1.0);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    if *req.method() == Method::POST && req.uri().path() == admission::VALIDATE_PATH {
        let body = req.into_body().collect().await?.to_bytes();
        return Ok(admission_response(&body));
    }

    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => text(StatusCode::OK, "ok"),
        "/readyz" | "/ready" => text(StatusCode::OK, "ok"),
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    respond(status, "text/plain", body)
}

/// Generate metrics response
fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    respond(StatusCode::OK, prometheus::TEXT_FORMAT, buffer)
}

/// Answer an AdmissionReview
fn admission_response(body: &[u8]) -> Response<Full<Bytes>> {
    match admission::review(body) {
        Ok(review) => respond(StatusCode::OK, "application/json", review),
        Err(e) => {
            error!(error = %e, "Malformed admission review");
            text(StatusCode::BAD_REQUEST, "malformed AdmissionReview")
        }
    }
}
