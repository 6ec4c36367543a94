// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Caller Reaper
//!
//! Background task that finds callers whose process has exited without
//! finalizing its context and tears them down, so their sessions and shared
//! memory do not stay open on the engine forever.
//!
//! ## Strategy
//!
//! Every `interval` (default 10 s) the reaper:
//! 1. Lists the connected callers.
//! 2. Asks [`CallerLiveness`] whether each caller process still exists.
//! 3. Finalizes the context of every caller that is gone, on a blocking
//!    worker, since teardown closes sessions on the engine.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken` for graceful shutdown.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::ids::CallerId;
use crate::proxy::TeeProxy;

/// Answers whether a caller is still running.
pub trait CallerLiveness: Send + Sync {
    fn is_alive(&self, caller: CallerId) -> bool;
}

/// Liveness by process id, checked with signal 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLiveness;

impl CallerLiveness for ProcessLiveness {
    fn is_alive(&self, caller: CallerId) -> bool {
        // Ids outside the pid range are not processes we can signal.
        let Ok(pid) = libc::pid_t::try_from(caller.0) else {
            return true;
        };
        if pid <= 0 {
            return true;
        }
        // SAFETY: signal 0 performs only the existence and permission check.
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

pub struct CallerReaper {
    proxy: Arc<TeeProxy>,
    dispatcher: Dispatcher,
    liveness: Arc<dyn CallerLiveness>,
    interval: Duration,
}

impl CallerReaper {
    pub fn new(proxy: Arc<TeeProxy>, dispatcher: Dispatcher, interval: Duration) -> Self {
        Self {
            proxy,
            dispatcher,
            liveness: Arc::new(ProcessLiveness),
            interval,
        }
    }

    pub fn with_liveness(mut self, liveness: Arc<dyn CallerLiveness>) -> Self {
        self.liveness = liveness;
        self
    }

    /// Run the reaper loop until the cancellation token is triggered.
    ///
    /// ```rust,ignore
    /// tokio::spawn(reaper.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Caller reaper starting"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Caller reaper shutting down");
                    return;
                }
            }

            self.sweep().await;
        }
    }

    /// One sweep: finalize every caller whose process is gone.
    ///
    /// Returns the callers that were reaped.
    pub async fn sweep(&self) -> Vec<CallerId> {
        let dead: Vec<CallerId> = self
            .proxy
            .callers()
            .into_iter()
            .filter(|caller| !self.liveness.is_alive(*caller))
            .collect();

        let mut reaped = Vec::with_capacity(dead.len());
        for caller in dead {
            let proxy = Arc::clone(&self.proxy);
            match self
                .dispatcher
                .run(move || proxy.finalize_context(caller))
                .await
            {
                Ok(Some(report)) => {
                    info!(
                        caller_id = %caller,
                        sessions = report.sessions,
                        shared_memory = report.regions,
                        "Caller reaper: finalized context of exited caller"
                    );
                    reaped.push(caller);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(caller_id = %caller, error = %e, "Caller reaper: teardown failed");
                }
            }
        }
        reaped
    }
}
