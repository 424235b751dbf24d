//! Metrics collection and exposition.
//!
//! # Metrics
//! - `plume_forwards_total` (counter): completed forwards by `status`
//! - `plume_pool_in_use` (gauge): forward contexts currently acquired
//! - `plume_client_connections_total` (counter): accepted client connections
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so the engine
//!   records unconditionally
//! - The Prometheus exporter serves its own HTTP listener

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::forward::ForwardStatus;

/// Install the Prometheus recorder and its scrape endpoint.
///
/// The exporter is spawned on the current tokio runtime, or on its own
/// thread when there is none.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_forward(status: ForwardStatus) {
    ::metrics::counter!("plume_forwards_total", "status" => status.as_str()).increment(1);
}

pub fn record_pool_in_use(in_use: usize) {
    ::metrics::gauge!("plume_pool_in_use").set(in_use as f64);
}

pub fn record_client_connection() {
    ::metrics::counter!("plume_client_connections_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_a_recorder_is_harmless() {
        record_forward(ForwardStatus::Success);
        record_pool_in_use(3);
        record_client_connection();
    }
}
