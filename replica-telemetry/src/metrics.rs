use std::net::{AddrParseError, SocketAddr};

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use thiserror::Error;

/// Address the Prometheus endpoint listens on when none is configured.
pub const DEFAULT_METRICS_LISTEN_ADDRESS: &str = "0.0.0.0:9000";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("invalid metrics listen address `{address}`: {source}")]
    InvalidAddress {
        address: String,
        source: AddrParseError,
    },

    #[error("failed to install the prometheus exporter: {0}")]
    Build(#[from] BuildError),
}

/// Installs the global metrics recorder and serves it over http at `listen_address`.
///
/// Every metric is labelled with the replicated `queue`. Must be called from within a
/// tokio runtime, the exporter spawns its listener on it.
pub fn init_metrics(listen_address: Option<&str>, queue: &str) -> Result<(), MetricsError> {
    let address = listen_address.unwrap_or(DEFAULT_METRICS_LISTEN_ADDRESS);
    let address: SocketAddr = address.parse().map_err(|source| MetricsError::InvalidAddress {
        address: address.to_owned(),
        source,
    })?;

    PrometheusBuilder::new()
        .with_http_listener(address)
        .add_global_label("queue", queue)
        .install()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_listen_address_is_rejected() {
        let err = init_metrics(Some("not an address"), "replika").unwrap_err();
        assert!(matches!(err, MetricsError::InvalidAddress { .. }));
    }
}
