//! Metrics collection and export for Parley.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use async_trait::async_trait;
use bytes::Bytes;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info};

use parley_core::HubHandle;
use parley_transport::{
    Connection, ConnectionId, ConnectionSink, ConnectionStream, Inbound, TransportError,
};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const MESSAGES_TOTAL: &str = "parley_messages_total";
    pub const MESSAGES_BYTES: &str = "parley_messages_bytes";
    pub const SESSIONS_ACTIVE: &str = "parley_sessions_active";
    pub const ROOMS_ACTIVE: &str = "parley_rooms_active";
    pub const SESSIONS_EVICTED: &str = "parley_sessions_evicted";
    pub const SESSION_ENDS_TOTAL: &str = "parley_session_ends_total";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames sent and received");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames sent and received");
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Sessions registered with the hub");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Rooms with at least one session");
    metrics::describe_gauge!(
        names::SESSIONS_EVICTED,
        "Sessions evicted for a full outbound queue since start"
    );
    metrics::describe_counter!(names::SESSION_ENDS_TOTAL, "Finished sessions by reason");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record why a session ended.
pub fn record_session_end(reason: &'static str) {
    counter!(names::SESSION_ENDS_TOTAL, "reason" => reason).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Periodically copy hub statistics into gauges until the hub stops.
pub async fn report_hub_stats(hub: HubHandle, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let Ok(stats) = hub.stats().await else {
            debug!("Hub stopped, ending stats reporter");
            break;
        };
        gauge!(names::SESSIONS_ACTIVE).set(stats.session_count as f64);
        gauge!(names::ROOMS_ACTIVE).set(stats.room_count as f64);
        gauge!(names::SESSIONS_EVICTED).set(stats.evicted_total as f64);
    }
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

/// A connection whose traffic is counted.
pub struct Metered<C> {
    inner: C,
}

impl<C: Connection> Metered<C> {
    /// Wrap a connection.
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

impl<C: Connection + 'static> Connection for Metered<C> {
    fn id(&self) -> &ConnectionId {
        self.inner.id()
    }

    fn remote_addr(&self) -> Option<String> {
        self.inner.remote_addr()
    }

    fn split(self: Box<Self>) -> (Box<dyn ConnectionSink>, Box<dyn ConnectionStream>) {
        let (sink, stream) = Box::new(self.inner).split();
        (
            Box::new(MeteredSink { inner: sink }),
            Box::new(MeteredStream { inner: stream }),
        )
    }
}

struct MeteredSink {
    inner: Box<dyn ConnectionSink>,
}

#[async_trait]
impl ConnectionSink for MeteredSink {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        let len = data.len();
        self.inner.send(data).await?;
        record_message(len, "outbound");
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.inner.ping().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}

struct MeteredStream {
    inner: Box<dyn ConnectionStream>,
}

#[async_trait]
impl ConnectionStream for MeteredStream {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        let item = self.inner.recv().await;
        match &item {
            Ok(Some(Inbound::Data(data))) => record_message(data.len(), "inbound"),
            Err(_) => record_error("transport"),
            _ => {}
        }
        item
    }
}
