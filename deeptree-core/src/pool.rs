//! Bounded worker pool for independent judgment calls.
//!
//! One task is spawned per item and a `tokio::sync::Semaphore` bounds how many
//! run at once. `run` joins every handle, keeping input order, before returning, so
//! callers never observe a partially finished batch. A task that panics or
//! cannot get a permit yields `None` in its slot.

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    width: usize,
}

impl WorkerPool {
    pub fn new(width: usize) -> Self {
        Self {
            width: width.max(1),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Run `task` over every item with at most `width` tasks in flight.
    pub async fn run<T, R, F, Fut>(&self, items: Vec<T>, task: F) -> Vec<Option<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.width));
        let task = Arc::new(task);
        let mut handles = Vec::with_capacity(items.len());

        for item in items {
            let sem = semaphore.clone();
            let task = task.clone();
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire().await.ok()?;
                Some(task(item).await)
            }));
        }

        join_all(handles)
            .await
            .into_iter()
            .enumerate()
            .map(|(index, joined)| match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(index, error = %e, "Worker task failed");
                    None
                }
            })
            .collect()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(3)
    }
}
