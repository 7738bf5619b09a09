//! Prometheus metrics for the ingestion core, served on the same minimal
//! `axum` surface as the teacher's metrics server, plus a `/healthz`
//! liveness endpoint backed by the control plane (spec §10.5).

use crate::control::ControlPlane;
use axum::extract::State;
use axum::{routing::get, Json, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

lazy_static! {
    /// Readings successfully decoded off a PLC, per PLC and group.
    pub static ref READINGS_POLLED: CounterVec = register_counter_vec!(
        "mc3e_readings_polled_total",
        "Total number of tag readings successfully polled",
        &["plc_code", "group"]
    )
    .unwrap();

    /// Readings committed to the remote store, per destination table.
    pub static ref READINGS_WRITTEN: CounterVec = register_counter_vec!(
        "mc3e_readings_written_total",
        "Total number of readings committed to the remote store",
        &["destination"]
    )
    .unwrap();

    pub static ref BUFFER_UTILISATION: Gauge = register_gauge!(
        "mc3e_buffer_utilisation_percent",
        "Circular buffer utilisation as a percentage of capacity"
    )
    .unwrap();

    pub static ref BUFFER_OVERFLOW: Gauge = register_gauge!(
        "mc3e_buffer_overflow_total",
        "Cumulative count of circular buffer overflow evictions"
    )
    .unwrap();

    pub static ref WRITER_BATCH_LATENCY: HistogramVec = register_histogram_vec!(
        "mc3e_writer_batch_commit_seconds",
        "Time taken to commit one batch to the remote store",
        &["outcome"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0]
    )
    .unwrap();

    pub static ref WRITER_BATCH_SIZE: HistogramVec = register_histogram_vec!(
        "mc3e_writer_batch_size",
        "Number of rows per writer batch",
        &["outcome"],
        vec![10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]
    )
    .unwrap();

    /// Connection failures observed per PLC, independent of which pool slot
    /// hit them.
    pub static ref CONNECTION_ERRORS: CounterVec = register_counter_vec!(
        "mc3e_connection_errors_total",
        "Total number of PLC connection errors",
        &["plc_code", "error_type"]
    )
    .unwrap();

    pub static ref GROUP_POLL_DURATION: HistogramVec = register_histogram_vec!(
        "mc3e_group_poll_duration_seconds",
        "Duration of one polling group cycle",
        &["group"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .unwrap();

    pub static ref ACTIVE_POLLING_GROUPS: GaugeVec = register_gauge_vec!(
        "mc3e_active_polling_groups",
        "Number of polling groups currently running",
        &["mode"]
    )
    .unwrap();
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    group_count: usize,
    buffer_utilisation: f64,
}

pub struct MetricsServer {
    port: u16,
    control: Arc<ControlPlane>,
}

impl MetricsServer {
    pub fn new(port: u16, control: Arc<ControlPlane>) -> Self {
        Self { port, control }
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(self.control);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

async fn healthz_handler(State(control): State<Arc<ControlPlane>>) -> Json<HealthBody> {
    let status = control.system_status().await;
    Json(HealthBody {
        status: "ok",
        group_count: status.group_count,
        buffer_utilisation: status.buffer.utilisation,
    })
}
