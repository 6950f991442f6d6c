use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::bail;
use crate::conversions::name::fq_name;
use crate::destination::memory::MemoryDestination;
use crate::error::{ErrorKind, ReplicaResult};
use crate::replication::copy::{CopyDelegate, CopyRequest};
use crate::state::snapshot::CopySnapshot;
use crate::transport::MemoryQueue;
use crate::types::RowData;

#[derive(Debug, Default)]
struct Inner {
    /// Source rows per table with their primary key columns.
    source: HashMap<String, (Vec<String>, Vec<RowData>)>,
    failing_tables: HashSet<String>,
    requests: Vec<CopyRequest>,
}

/// Copies source rows kept in memory into a [`MemoryDestination`].
///
/// The snapshot of a copy is a tick forced on the queue when the copy runs: events
/// published before the copy are expected to be part of the source rows.
#[derive(Debug, Clone)]
pub struct MemoryCopyDelegate {
    queue: MemoryQueue,
    destination: MemoryDestination,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryCopyDelegate {
    pub fn new(queue: MemoryQueue, destination: MemoryDestination) -> Self {
        Self {
            queue,
            destination,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Sets the rows the copy of `table` reads.
    pub async fn set_source_rows(&self, table: &str, pkey_columns: &[&str], rows: Vec<RowData>) {
        let pkey_columns = pkey_columns.iter().map(|c| c.to_string()).collect();
        let mut inner = self.inner.lock().await;
        inner.source.insert(fq_name(table), (pkey_columns, rows));
    }

    /// Makes every copy of `table` fail.
    pub async fn fail_table(&self, table: &str) {
        let mut inner = self.inner.lock().await;
        inner.failing_tables.insert(fq_name(table));
    }

    /// Returns the copies requested so far.
    pub async fn requests(&self) -> Vec<CopyRequest> {
        self.inner.lock().await.requests.clone()
    }
}

impl CopyDelegate for MemoryCopyDelegate {
    async fn copy_table(&self, request: &CopyRequest) -> ReplicaResult<CopySnapshot> {
        let (pkey_columns, rows) = {
            let mut inner = self.inner.lock().await;
            inner.requests.push(request.clone());

            if inner.failing_tables.contains(&request.table) {
                bail!(ErrorKind::QueryFailed, "Injected copy failure", request.table);
            }

            inner
                .source
                .get(&request.table)
                .cloned()
                .unwrap_or_default()
        };

        let tick_id = self.queue.tick().await;
        self.destination
            .replace_table_rows(&request.dest_table, &pkey_columns, rows)
            .await;

        Ok(CopySnapshot::new(tick_id))
    }
}
