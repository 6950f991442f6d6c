use std::collections::HashMap;
use std::mem;
use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::error::{ReplicaError, ReplicaResult};
use crate::workers::base::{Worker, WorkerHandle};
use crate::workers::copy::CopyWorkerHandle;

/// Internal state for [`CopyWorkerPool`].
#[derive(Debug)]
pub struct CopyWorkerPoolInner {
    /// Running copy workers indexed by table name.
    active: HashMap<String, CopyWorkerHandle>,
    /// Copy workers that marked themselves finished but were not collected yet.
    finished: HashMap<String, Vec<CopyWorkerHandle>>,
    /// Errors of collected workers, reported by [`CopyWorkerPool::wait_all`].
    errors: Vec<ReplicaError>,
    pool_update: Arc<Notify>,
}

impl CopyWorkerPoolInner {
    fn new() -> Self {
        Self {
            active: HashMap::new(),
            finished: HashMap::new(),
            errors: Vec::new(),
            pool_update: Arc::new(Notify::new()),
        }
    }

    /// Starts `worker` unless a worker for the same table is already running.
    ///
    /// Returns `Ok(false)` if a worker for the table already exists.
    pub async fn start_worker<W>(&mut self, table: &str, worker: W) -> ReplicaResult<bool>
    where
        W: Worker<CopyWorkerHandle>,
    {
        if self.active.contains_key(table) {
            warn!(%table, "copy worker already exists in the pool");
            return Ok(false);
        }

        self.prune_finished().await;

        let handle = worker.start().await?;
        self.active.insert(table.to_owned(), handle);

        debug!(%table, active = self.active.len(), "added copy worker to the pool");

        Ok(true)
    }

    /// Moves the worker of `table` from the active to the finished workers.
    pub fn mark_worker_finished(&mut self, table: &str) {
        let removed_worker = self.active.remove(table);

        self.pool_update.notify_waiters();

        if let Some(removed_worker) = removed_worker {
            self.finished
                .entry(table.to_owned())
                .or_default()
                .push(removed_worker);
        }
    }

    /// Collects the finished workers whose task already ended, keeping their errors.
    async fn prune_finished(&mut self) {
        let mut pruned = 0;
        for workers in self.finished.values_mut() {
            let (done, running): (Vec<_>, Vec<_>) =
                workers.drain(..).partition(CopyWorkerHandle::is_finished);
            *workers = running;

            for worker in done {
                if let Err(err) = worker.wait().await {
                    self.errors.push(err);
                }
                pruned += 1;
            }
        }
        self.finished.retain(|_, workers| !workers.is_empty());

        if pruned > 0 {
            debug!(pruned, "collected finished copy workers");
        }
    }

    pub fn finished_count(&self) -> usize {
        self.finished.values().map(Vec::len).sum()
    }

    pub fn is_active(&self, table: &str) -> bool {
        self.active.contains_key(table)
    }

    pub fn active_tables(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    /// Collects the finished workers once no worker is active anymore.
    ///
    /// Returns `Ok(Some(notify))` while workers are active, the caller waits on it and
    /// tries again.
    pub async fn wait_all(&mut self) -> ReplicaResult<Option<Arc<Notify>>> {
        // Waiting on active workers while holding the lock would deadlock, they lock the
        // pool to mark themselves finished.
        if !self.active.is_empty() {
            return Ok(Some(self.pool_update.clone()));
        }

        let mut errors = mem::take(&mut self.errors);
        for (_, workers) in mem::take(&mut self.finished) {
            for worker in workers {
                if let Err(err) = worker.wait().await {
                    errors.push(err);
                }
            }
        }

        if !errors.is_empty() {
            return Err(ReplicaError::many(errors));
        }

        Ok(None)
    }
}

/// Pool of the copy workers of one queue.
#[derive(Debug, Clone)]
pub struct CopyWorkerPool {
    inner: Arc<Mutex<CopyWorkerPoolInner>>,
}

impl CopyWorkerPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CopyWorkerPoolInner::new())),
        }
    }

    /// Waits until every copy worker finished, returning the errors they failed with.
    pub async fn wait_all(&self) -> ReplicaResult<()> {
        loop {
            let mut workers = self.inner.lock().await;
            let Some(notify) = workers.wait_all().await? else {
                return Ok(());
            };

            // Registered before unlocking so that a worker finishing in between is seen.
            let notified = notify.notified();
            drop(workers);

            notified.await;
        }
    }
}

impl Default for CopyWorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for CopyWorkerPool {
    type Target = Mutex<CopyWorkerPoolInner>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorKind;
    use crate::replica_error;

    struct TaskWorker(ReplicaResult<()>);

    impl Worker<CopyWorkerHandle> for TaskWorker {
        async fn start(self) -> ReplicaResult<CopyWorkerHandle> {
            let result = self.0;
            Ok(CopyWorkerHandle::new(tokio::spawn(async move { result })))
        }
    }

    async fn wait_for_tasks(inner: &CopyWorkerPoolInner) {
        for _ in 0..100 {
            if inner.finished.values().flatten().all(CopyWorkerHandle::is_finished) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn finished_workers_are_collected_when_a_copy_starts() {
        let pool = CopyWorkerPool::new();
        let mut inner = pool.lock().await;

        inner
            .start_worker("public.a", TaskWorker(Ok(())))
            .await
            .unwrap();
        inner
            .start_worker(
                "public.b",
                TaskWorker(Err(replica_error!(ErrorKind::CopyFailed, "Bulk copy failed"))),
            )
            .await
            .unwrap();
        inner.mark_worker_finished("public.a");
        inner.mark_worker_finished("public.b");
        assert_eq!(inner.finished_count(), 2);

        wait_for_tasks(&inner).await;
        inner
            .start_worker("public.c", TaskWorker(Ok(())))
            .await
            .unwrap();
        assert_eq!(inner.finished_count(), 0);
        assert!(inner.is_active("public.c"));

        inner.mark_worker_finished("public.c");
        drop(inner);

        let err = pool.wait_all().await.unwrap_err();
        assert_eq!(err.kinds(), vec![ErrorKind::CopyFailed]);
    }
}
