use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{warn, Instrument};

#[derive(Debug, thiserror::Error)]
#[error("Page worker pool is shutting down")]
pub(crate) struct PoolClosed;

/// Runs page fetches of one connection, at most `workers` at a time.
pub(crate) struct PageWorkerPool {
    permits: Arc<Semaphore>,
    /// `None` once shut down.
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl PageWorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            tasks: Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Queues `job` until a worker is free. Fails once the pool shut down.
    pub fn submit<F>(&self, job: F) -> Result<(), PoolClosed>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self
            .tasks
            .lock()
            .expect("No one should panic while holding this lock");
        let Some(tasks) = tasks.as_mut() else {
            return Err(PoolClosed);
        };
        while tasks.try_join_next().is_some() {}

        let permits = self.permits.clone();
        tasks.spawn(
            async move {
                // Closed while the job was queued
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                job.await;
            }
            .in_current_span(),
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tasks
            .lock()
            .expect("No one should panic while holding this lock")
            .is_none()
    }

    /// Rejects new jobs, drops queued ones and gives running ones `grace`
    /// to finish before aborting them.
    pub async fn shutdown(&self, grace: Duration) {
        let tasks = self
            .tasks
            .lock()
            .expect("No one should panic while holding this lock")
            .take();
        let Some(mut tasks) = tasks else {
            return;
        };
        self.permits.close();

        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "Aborting page fetches that did not finish in time");
            tasks.shutdown().await;
        }
    }
}
