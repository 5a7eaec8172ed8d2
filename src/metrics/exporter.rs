//! Prometheus metrics for a run.
//!
//! [`PrometheusSink`] turns agent events into counters and histograms on a
//! registry owned by the [`Exporter`], which serves them over HTTP.

use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::funnel::MetricsSink;
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const NAMESPACE: &str = "mqhammer";

/// Seconds, from 1ms up to 2min
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn histogram(registry: &Registry, name: &str, help: &str) -> Result<Histogram> {
    let opts = HistogramOpts::new(name, help)
        .namespace(NAMESPACE)
        .buckets(LATENCY_BUCKETS.to_vec());
    let histogram = Histogram::with_opts(opts)?;
    registry.register(Box::new(histogram.clone()))?;
    Ok(histogram)
}

/// Updates Prometheus collectors from agent events
pub struct PrometheusSink {
    actions: IntCounterVec,
    action_latency: HistogramVec,
    schedule_lag: Histogram,
    messages_received: IntCounter,
    bytes_received: IntCounter,
    connections: IntCounterVec,
    connect_latency: Histogram,
    agents_running: IntGauge,
    agents_finished: IntCounterVec,
    reference_checks: IntCounterVec,
    reference_missing: IntCounter,
    reference_mismatched: IntCounter,
    reference_completion: Histogram,
    running: HashSet<usize>,
}

impl PrometheusSink {
    pub fn new(registry: &Registry) -> Result<Self> {
        let action_latency = HistogramVec::new(
            HistogramOpts::new(
                "action_latency_seconds",
                "Time from sending an action until the broker acknowledged it",
            )
            .namespace(NAMESPACE)
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["action"],
        )?;
        registry.register(Box::new(action_latency.clone()))?;

        let agents_running = IntGauge::with_opts(
            Opts::new("agents_running", "Agents currently connected").namespace(NAMESPACE),
        )?;
        registry.register(Box::new(agents_running.clone()))?;

        Ok(Self {
            actions: counter_vec(
                registry,
                "actions_total",
                "Scenario actions by type and outcome",
                &["action", "outcome"],
            )?,
            action_latency,
            schedule_lag: histogram(
                registry,
                "schedule_lag_seconds",
                "How late actions started relative to their scheduled offset",
            )?,
            messages_received: counter(
                registry,
                "messages_received_total",
                "Publications delivered to agents",
            )?,
            bytes_received: counter(
                registry,
                "bytes_received_total",
                "Payload bytes delivered to agents",
            )?,
            connections: counter_vec(
                registry,
                "connections_total",
                "Connection attempts by result",
                &["result"],
            )?,
            connect_latency: histogram(
                registry,
                "connect_latency_seconds",
                "Time until the broker accepted a connection",
            )?,
            agents_running,
            agents_finished: counter_vec(
                registry,
                "agents_finished_total",
                "Agents that reached a terminal state",
                &["state"],
            )?,
            reference_checks: counter_vec(
                registry,
                "reference_checks_total",
                "Reference completeness checks by result",
                &["result"],
            )?,
            reference_missing: counter(
                registry,
                "reference_missing_total",
                "Expected reference topics never received",
            )?,
            reference_mismatched: counter(
                registry,
                "reference_mismatched_total",
                "Reference topics received with an unexpected payload",
            )?,
            reference_completion: histogram(
                registry,
                "reference_completion_seconds",
                "Time from subscribe until all expected reference topics arrived",
            )?,
            running: HashSet::new(),
        })
    }
}

impl MetricsSink for PrometheusSink {
    fn consume(&mut self, event: &Event) {
        match &event.kind {
            EventKind::Connected { latency } => {
                self.connections.with_label_values(&["ok"]).inc();
                self.connect_latency.observe(latency.as_secs_f64());
                if self.running.insert(event.agent.ordinal) {
                    self.agents_running.inc();
                }
            }
            EventKind::ConnectFailed { .. } => {
                self.connections.with_label_values(&["failed"]).inc();
            }
            EventKind::ConnectionLost { .. } => {
                self.connections.with_label_values(&["lost"]).inc();
                if self.running.remove(&event.agent.ordinal) {
                    self.agents_running.dec();
                }
            }
            EventKind::ActionCompleted {
                action,
                outcome,
                latency,
                lag,
                ..
            } => {
                self.actions
                    .with_label_values(&[action.as_str(), outcome.label()])
                    .inc();
                if outcome.is_ok() {
                    self.action_latency
                        .with_label_values(&[action.as_str()])
                        .observe(latency.as_secs_f64());
                }
                self.schedule_lag.observe(lag.as_secs_f64());
            }
            EventKind::MessageReceived { bytes, .. } => {
                self.messages_received.inc();
                self.bytes_received.inc_by(*bytes as u64);
            }
            EventKind::ReferenceChecked(report) => {
                let result = if report.is_complete() {
                    self.reference_completion
                        .observe(report.elapsed.as_secs_f64());
                    "complete"
                } else {
                    "incomplete"
                };
                self.reference_checks.with_label_values(&[result]).inc();
                self.reference_missing.inc_by(report.missing() as u64);
                self.reference_mismatched.inc_by(report.mismatched as u64);
            }
            EventKind::Finished { state } => {
                if self.running.remove(&event.agent.ordinal) {
                    self.agents_running.dec();
                }
                self.agents_finished
                    .with_label_values(&[state.as_str()])
                    .inc();
            }
        }
    }
}

/// HTTP endpoint serving `/metrics` and `/health`
pub struct Exporter {
    listener: TcpListener,
    registry: Registry,
}

impl Exporter {
    /// Bind the listener. `":8080"` listens on all interfaces.
    pub async fn bind(addr: &str) -> Result<Self> {
        let addr = normalize_addr(addr);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| Error::ExporterBind {
                addr: addr.clone(),
                source,
            })?;
        Ok(Self {
            listener,
            registry: Registry::new(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Serve until `cancel` fires
    pub fn serve(self, cancel: CancellationToken) -> JoinHandle<()> {
        let local = self.local_addr();
        let app = Router::new()
            .route("/metrics", get(render_metrics))
            .route("/health", get(health))
            .with_state(self.registry);

        tokio::spawn(async move {
            if let Some(addr) = local {
                info!("Serving metrics at http://{}/metrics", addr);
            }
            let result = axum::serve(self.listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("Metrics server failed: {}", e);
            }
        })
    }
}

fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

async fn render_metrics(State(registry): State<Registry>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("# Error encoding metrics: {}", e),
        )
            .into_response();
    }

    let mut response = Response::new(Body::from(buffer));
    if let Ok(content_type) = header::HeaderValue::from_str(encoder.format_type()) {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
    }
    response
}

async fn health() -> &'static str {
    "ok"
}
