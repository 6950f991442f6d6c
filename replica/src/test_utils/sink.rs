use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;

use crate::apply::BatchSink;
use crate::bail;
use crate::error::{ErrorKind, ReplicaResult};

/// A [`BatchSink`] keeping every flushed payload in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    flushed: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the flushed payloads with their batch keys, in flush order.
    pub async fn flushed(&self) -> Vec<(String, serde_json::Value)> {
        self.flushed.lock().await.clone()
    }

    pub async fn flushed_keys(&self) -> Vec<String> {
        self.flushed
            .lock()
            .await
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }
}

impl BatchSink for MemorySink {
    async fn flush(&self, key: &str, payload: Vec<u8>) -> ReplicaResult<()> {
        let payload = serde_json::from_slice(&payload)?;
        self.flushed.lock().await.push((key.to_owned(), payload));

        Ok(())
    }
}

/// A [`BatchSink`] failing a number of flushes before delegating to `inner`.
#[derive(Debug, Clone)]
pub struct FailingSink<K> {
    inner: K,
    remaining_failures: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl<K> FailingSink<K> {
    pub fn new(inner: K, failures: usize) -> Self {
        Self {
            inner,
            remaining_failures: Arc::new(AtomicUsize::new(failures)),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn inner(&self) -> &K {
        &self.inner
    }

    /// Number of flush calls, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl<K> BatchSink for FailingSink<K>
where
    K: BatchSink,
{
    async fn flush(&self, key: &str, payload: Vec<u8>) -> ReplicaResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if failed {
            bail!(ErrorKind::SinkFlushFailed, "Injected sink failure", key);
        }

        self.inner.flush(key, payload).await
    }
}
