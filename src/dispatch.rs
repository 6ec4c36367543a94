// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Bounded pool for blocking bridge calls.
//!
//! Bridge calls block for as long as the Trusted Application runs, so the
//! async surface hands each one to `spawn_blocking`. A semaphore caps how many
//! run at once; callers past the cap wait for a permit instead of piling up
//! blocking threads.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("worker pool is closed")]
    Closed,

    #[error("blocking worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl Dispatcher {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Run `task` on a blocking worker once a permit is free.
    pub async fn run<F, T>(&self, task: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::Closed)?;
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            task()
        })
        .await?;
        Ok(result)
    }

    /// Run `task` on a blocking worker without waiting for a permit.
    ///
    /// Used for cancellations, which must get through even when every permit
    /// is held by a call waiting to be cancelled.
    pub fn spawn_detached<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::task::spawn_blocking(task);
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                warn!(error = %e, "detached bridge call failed");
            }
        });
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Free permits; zero once the pool is closed.
    pub fn available(&self) -> usize {
        if self.permits.is_closed() {
            return 0;
        }
        self.permits.available_permits()
    }

    /// Stop handing out permits; pending and future `run` calls fail.
    pub fn close(&self) {
        self.permits.close();
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_INFLIGHT_CALLS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_blocking_work() {
        let dispatcher = Dispatcher::new(2);
        let value = dispatcher.run(|| 6 * 7).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(dispatcher.available(), 2);
    }

    #[tokio::test]
    async fn never_exceeds_limit() {
        let dispatcher = Dispatcher::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let dispatcher = dispatcher.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                dispatcher
                    .run(move || {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(10));
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn closed_pool_rejects_work() {
        let dispatcher = Dispatcher::new(1);
        dispatcher.close();
        assert!(matches!(
            dispatcher.run(|| ()).await,
            Err(DispatchError::Closed)
        ));
    }
}
