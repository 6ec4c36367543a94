// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Operation keys and the table of in-flight operations.
//!
//! A key is `(epoch << 32) | counter`. The epoch mixes the process id with the
//! start time so keys from a restarted proxy do not collide with keys an
//! engine may still remember; the counter is monotonic for the process
//! lifetime.
//!
//! A [`PendingOperations`] entry maps `(caller, client operation id)` to the
//! key of the open/invoke call currently running for it. The entry lives
//! exactly as long as its [`PendingGuard`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::ids::{CallerId, ClientOperationId, OperationKey};

#[derive(Debug)]
pub struct OperationKeyAllocator {
    epoch: u32,
    counter: AtomicU32,
}

impl Default for OperationKeyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationKeyAllocator {
    pub fn new() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.subsec_nanos() ^ (elapsed.as_secs() as u32))
            .unwrap_or_default();
        Self::with_epoch(std::process::id().rotate_left(16) ^ nanos)
    }

    pub fn with_epoch(epoch: u32) -> Self {
        Self {
            epoch,
            counter: AtomicU32::new(0),
        }
    }

    pub fn next(&self) -> OperationKey {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        OperationKey((u64::from(self.epoch) << 32) | u64::from(sequence))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("operation {operation} of caller {caller} is already in flight")]
pub struct OperationInFlight {
    pub caller: CallerId,
    pub operation: ClientOperationId,
}

type PendingMap = HashMap<(CallerId, ClientOperationId), OperationKey>;

#[derive(Debug, Default)]
pub struct PendingOperations {
    keys: OperationKeyAllocator,
    entries: Arc<Mutex<PendingMap>>,
}

fn lock_entries(entries: &Mutex<PendingMap>) -> MutexGuard<'_, PendingMap> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PendingOperations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a key for one open/invoke call.
    ///
    /// When the caller supplied an operation id the key is recorded so a
    /// later cancellation can find it.
    pub fn begin(
        &self,
        caller: CallerId,
        operation: Option<ClientOperationId>,
    ) -> Result<PendingGuard, OperationInFlight> {
        let key = self.keys.next();
        if let Some(operation) = operation {
            let mut entries = lock_entries(&self.entries);
            if entries.contains_key(&(caller, operation)) {
                return Err(OperationInFlight { caller, operation });
            }
            entries.insert((caller, operation), key);
            debug!(caller_id = %caller, operation_id = %operation, operation_key = %key, "operation pending");
        }
        Ok(PendingGuard {
            key,
            slot: operation.map(|operation| (caller, operation)),
            entries: Arc::clone(&self.entries),
        })
    }

    pub fn lookup(&self, caller: CallerId, operation: ClientOperationId) -> Option<OperationKey> {
        lock_entries(&self.entries).get(&(caller, operation)).copied()
    }

    /// Drop every entry of a caller.
    pub fn forget_caller(&self, caller: CallerId) -> usize {
        let mut entries = lock_entries(&self.entries);
        let before = entries.len();
        entries.retain(|(owner, _), _| *owner != caller);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        lock_entries(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps one pending entry alive; removes it on drop.
#[derive(Debug)]
pub struct PendingGuard {
    key: OperationKey,
    slot: Option<(CallerId, ClientOperationId)>,
    entries: Arc<Mutex<PendingMap>>,
}

impl PendingGuard {
    pub fn key(&self) -> OperationKey {
        self.key
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let Some(slot) = self.slot else {
            return;
        };
        let mut entries = lock_entries(&self.entries);
        if entries.get(&slot) == Some(&self.key) {
            entries.remove(&slot);
        }
    }
}
