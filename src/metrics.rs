//! Prometheus metrics, grounded directly on `mem_etcd::metrics`: statics
//! registered lazily via `once_cell::Lazy`, forced into existence at
//! startup by [`init`], served over HTTP by an `axum` router.

use once_cell::sync::Lazy;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry as PromRegistry, TextEncoder};

static REGISTRY: Lazy<PromRegistry> = Lazy::new(PromRegistry::new);

pub static FRAMES_RECEIVED: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("broker_frames_received_total", "control frames received"),
        &["mode"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static FRAMES_MALFORMED: Lazy<prometheus::IntCounter> = Lazy::new(|| {
    let counter = prometheus::IntCounter::new(
        "broker_frames_malformed_total",
        "control frames rejected as malformed or oversized",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static REGISTRATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("broker_registrations_total", "successful registrations"),
        &["mode"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static EVICTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("broker_evictions_total", "subscribers evicted on lease expiry"),
        &["mode"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static REFRESH_NOTICES: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("broker_refresh_notices_total", "refresh_req notices sent"),
        &["mode"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static ACTIVE_SUBSCRIBERS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("broker_active_subscribers", "currently registered subscribers"),
        &["mode"],
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static STREAM_WORKER_UP: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("broker_stream_worker_up", "1 if the mode's worker task is running"),
        &["mode"],
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static UPSTREAM_ERRORS: Lazy<prometheus::IntCounter> = Lazy::new(|| {
    let counter =
        prometheus::IntCounter::new("broker_upstream_errors_total", "upstream source poll failures")
            .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static TRANSACTIONS_FANNED_OUT: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "broker_transactions_fanned_out_total",
            "stream_data notices sent to subscribers",
        ),
        &["mode"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Force every lazily-registered metric into existence. Call once at
/// startup so `/metrics` is non-empty even before any traffic arrives.
pub fn init() {
    Lazy::force(&FRAMES_RECEIVED);
    Lazy::force(&FRAMES_MALFORMED);
    Lazy::force(&REGISTRATIONS);
    Lazy::force(&EVICTIONS);
    Lazy::force(&REFRESH_NOTICES);
    Lazy::force(&ACTIVE_SUBSCRIBERS);
    Lazy::force(&STREAM_WORKER_UP);
    Lazy::force(&UPSTREAM_ERRORS);
    Lazy::force(&TRANSACTIONS_FANNED_OUT);
}

/// Render the current metric set in Prometheus text exposition format.
pub fn render() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;

    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    encoder.encode(&families, &mut buf)?;
    String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Axum handler for `GET /metrics`.
pub async fn metrics_handler() -> impl axum::response::IntoResponse {
    match render() {
        Ok(body) => (axum::http::StatusCode::OK, body),
        Err(err) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to render metrics: {err}"),
        ),
    }
}

/// Build the standalone metrics router, grounded on `mem_etcd::main`'s
/// separate metrics-port axum server.
pub fn router() -> axum::Router {
    axum::Router::new().route("/metrics", axum::routing::get(metrics_handler))
}
