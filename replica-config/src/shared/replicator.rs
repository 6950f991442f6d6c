use serde::Deserialize;

use crate::shared::{PgConnectionConfig, ValidationError, WorkerConfig};

/// Complete configuration of the worker binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReplicatorConfig {
    pub worker: WorkerConfig,
    /// Provider database holding the queue.
    pub source: PgConnectionConfig,
    /// Database the changes are applied to.
    pub destination: PgConnectionConfig,
    /// Database holding the table states, defaults to the destination.
    #[serde(default)]
    pub state_store: Option<PgConnectionConfig>,
    /// Address of the prometheus listener, disabled when unset.
    #[serde(default)]
    pub metrics_listen_address: Option<String>,
}

impl ReplicatorConfig {
    /// Validates the complete configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.worker.validate()
    }

    /// Connection used by the table state store.
    pub fn state_store_connection(&self) -> &PgConnectionConfig {
        self.state_store.as_ref().unwrap_or(&self.destination)
    }
}
