// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # TEE proxy
//!
//! The caller-facing operations of the multiplexer. Each call is keyed by the
//! caller's identity and is translated through that caller's registry before
//! reaching the bridge.
//!
//! Every method here is synchronous and may block on the engine. The HTTP
//! layer runs them through [`crate::dispatch::Dispatcher`].
//!
//! ## Open / invoke flow
//!
//! 1. Rewrite registered memory references to bridge ids (unknown id fails
//!    with `BadParameters` before the bridge is called).
//! 2. Allocate an operation key and, when the caller named the operation,
//!    record it so a cancellation can find it.
//! 3. Call the bridge.
//! 4. Record the session pair (open only, on success).
//! 5. Rewrite the returned operation back to caller-facing ids.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::{BridgeError, InvokeCall, NativeBridge, OpenSessionCall};
use crate::config;
use crate::directory::{Caller, CallerDirectory, DirectorySettings};
use crate::ids::{CallerId, ClientOperationId, ContextToken, MemoryId, SessionId};
use crate::pending::PendingOperations;
use crate::registry::{RegistryError, SharedMemoryRegion, TeardownReport};
use crate::tee::{ConnectionMethod, MemoryFlags, Operation, ReturnCode, ReturnOrigin};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("caller {0} has no initialized context")]
    UnknownCaller(CallerId),

    #[error("bad parameters: {0}")]
    BadParameters(String),

    #[error("shared memory of {size} bytes exceeds the {limit} byte limit")]
    OutOfMemory { size: usize, limit: usize },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl ProxyError {
    pub fn return_code(&self) -> ReturnCode {
        match self {
            Self::UnknownCaller(_) => ReturnCode::ACCESS_DENIED,
            Self::BadParameters(_) => ReturnCode::BAD_PARAMETERS,
            Self::OutOfMemory { .. } => ReturnCode::OUT_OF_MEMORY,
            Self::Registry(RegistryError::DuplicateId { .. }) => ReturnCode::BAD_PARAMETERS,
            Self::Registry(RegistryError::NotFound { .. }) => ReturnCode::ITEM_NOT_FOUND,
            Self::Registry(_) => ReturnCode::BAD_STATE,
            Self::Bridge(BridgeError::SharedMemory(_)) => ReturnCode::OUT_OF_MEMORY,
            Self::Bridge(BridgeError::UnknownHandle(_)) => ReturnCode::ITEM_NOT_FOUND,
            Self::Bridge(_) => ReturnCode::COMMUNICATION,
        }
    }

    pub fn return_origin(&self) -> ReturnOrigin {
        match self {
            Self::Bridge(_) => ReturnOrigin::Comms,
            _ => ReturnOrigin::Api,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub directory: DirectorySettings,
    pub max_shared_memory: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            directory: DirectorySettings {
                tee_name: None,
                transport: config::DEFAULT_TEE_TRANSPORT.to_owned(),
                finalize_when_idle: false,
            },
            max_shared_memory: config::DEFAULT_MAX_SHARED_MEMORY_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenSessionRequest {
    pub session_id: SessionId,
    pub trusted_app: Uuid,
    pub connection_method: ConnectionMethod,
    pub connection_data: u32,
    pub operation: Option<Operation>,
    pub operation_id: Option<ClientOperationId>,
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub session_id: SessionId,
    pub command_id: u32,
    pub operation: Option<Operation>,
    pub operation_id: Option<ClientOperationId>,
}

/// What the engine reported for an open or invoke call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    pub return_code: ReturnCode,
    pub return_origin: ReturnOrigin,
    /// Operation as returned by the engine, in caller-facing ids.
    pub operation: Option<Operation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerSummary {
    pub caller: CallerId,
    pub sessions: usize,
    pub shared_memory: usize,
    pub connected_at: DateTime<Utc>,
}

pub struct TeeProxy {
    bridge: Arc<dyn NativeBridge>,
    directory: CallerDirectory,
    pending: PendingOperations,
    max_shared_memory: usize,
}

impl TeeProxy {
    pub fn new(bridge: Arc<dyn NativeBridge>, settings: ProxySettings) -> Self {
        Self {
            directory: CallerDirectory::new(Arc::clone(&bridge), settings.directory),
            bridge,
            pending: PendingOperations::new(),
            max_shared_memory: settings.max_shared_memory,
        }
    }

    fn caller(&self, caller: CallerId) -> Result<Arc<Caller>, ProxyError> {
        self.directory
            .get(caller)
            .ok_or(ProxyError::UnknownCaller(caller))
    }

    fn to_bridge(entry: &Caller, operation: Option<&Operation>) -> Result<Option<Operation>, ProxyError> {
        let Some(operation) = operation else {
            return Ok(None);
        };
        operation.check().map_err(ProxyError::BadParameters)?;
        entry
            .registry
            .operation_to_bridge(operation)
            .map(Some)
            .map_err(|id| {
                ProxyError::BadParameters(format!("shared memory {id} is not registered"))
            })
    }

    /// Connect a caller. Returns when the caller first connected.
    pub fn initialize_context(
        &self,
        caller: CallerId,
        tee_name: Option<&str>,
    ) -> Result<DateTime<Utc>, ProxyError> {
        let entry = self.directory.connect(caller, tee_name)?;
        Ok(entry.connected_at)
    }

    /// Tear down a caller. Unknown callers are a no-op.
    pub fn finalize_context(&self, caller: CallerId) -> Option<TeardownReport> {
        let report = self.directory.disconnect(caller);
        let forgotten = self.pending.forget_caller(caller);
        if forgotten > 0 {
            debug!(caller_id = %caller, forgotten, "dropped pending operations");
        }
        report
    }

    pub fn register_shared_memory(
        &self,
        caller: CallerId,
        memory_id: MemoryId,
        flags: MemoryFlags,
        buffer: &[u8],
    ) -> Result<Arc<SharedMemoryRegion>, ProxyError> {
        let entry = self.caller(caller)?;
        if buffer.len() > self.max_shared_memory {
            return Err(ProxyError::OutOfMemory {
                size: buffer.len(),
                limit: self.max_shared_memory,
            });
        }
        if !flags.is_valid() {
            return Err(ProxyError::BadParameters(format!(
                "invalid shared memory flags {:#x}",
                flags.0
            )));
        }
        if entry.registry.contains_shared_memory(memory_id) {
            return Err(ProxyError::BadParameters(format!(
                "shared memory {memory_id} is already registered"
            )));
        }

        let bridge_id = self
            .bridge
            .register_shared_memory(buffer, flags, memory_id)?;
        let region = SharedMemoryRegion::new(memory_id, flags, buffer.len());
        match entry.registry.add_shared_memory(bridge_id, region) {
            Ok(region) => {
                info!(caller_id = %caller, memory_id = %memory_id, bridge_id = %bridge_id, size = buffer.len(), "shared memory registered");
                Ok(region)
            }
            Err(e) => {
                warn!(caller_id = %caller, memory_id = %memory_id, bridge_id = %bridge_id, error = %e, "rolling back shared memory registration");
                if let Err(release) = self.bridge.release_shared_memory(bridge_id) {
                    warn!(bridge_id = %bridge_id, error = %release, "rollback release failed");
                }
                Err(e.into())
            }
        }
    }

    /// Release a region. Returns whether anything was released.
    pub fn release_shared_memory(&self, caller: CallerId, memory_id: MemoryId) -> bool {
        let Some(entry) = self.directory.get(caller) else {
            debug!(caller_id = %caller, memory_id = %memory_id, "release for unknown caller");
            return false;
        };
        match entry.registry.remove_shared_memory_by_caller_id(memory_id) {
            Ok(bridge_id) => {
                info!(caller_id = %caller, memory_id = %memory_id, bridge_id = %bridge_id, "shared memory released");
                true
            }
            Err(e) => {
                debug!(caller_id = %caller, memory_id = %memory_id, error = %e, "release miss");
                false
            }
        }
    }

    pub fn open_session(
        &self,
        caller: CallerId,
        request: OpenSessionRequest,
    ) -> Result<CallResult, ProxyError> {
        let entry = self.caller(caller)?;
        if entry.registry.contains_session(request.session_id) {
            return Err(ProxyError::BadParameters(format!(
                "session {} is already open",
                request.session_id
            )));
        }

        let operation = Self::to_bridge(&entry, request.operation.as_ref())?;
        let pending = self
            .pending
            .begin(caller, request.operation_id)
            .map_err(|e| ProxyError::BadParameters(e.to_string()))?;

        debug!(caller_id = %caller, session_id = %request.session_id, trusted_app = %request.trusted_app, operation_key = %pending.key(), "opening session");
        let outcome = self.bridge.open_session(OpenSessionCall {
            session_id: request.session_id,
            trusted_app: request.trusted_app,
            connection_method: request.connection_method,
            connection_data: request.connection_data,
            operation: operation.as_ref(),
            key: pending.key(),
        });
        drop(pending);

        if outcome.return_code.is_success() {
            let Some(bridge_id) = outcome.bridge_id else {
                return Err(BridgeError::Protocol("engine opened a session without an id".into()).into());
            };
            if let Err(e) = entry.registry.add_session(request.session_id, bridge_id) {
                warn!(caller_id = %caller, session_id = %request.session_id, bridge_id = %bridge_id, error = %e, "closing session that could not be recorded");
                if let Err(close) = self.bridge.close_session(bridge_id) {
                    warn!(bridge_id = %bridge_id, error = %close, "rollback close failed");
                }
                return Err(e.into());
            }
            info!(caller_id = %caller, session_id = %request.session_id, bridge_id = %bridge_id, "session opened");
        } else {
            info!(caller_id = %caller, session_id = %request.session_id, return_code = %outcome.return_code, origin = ?outcome.return_origin, "open session refused");
        }

        Ok(CallResult {
            return_code: outcome.return_code,
            return_origin: outcome.return_origin,
            operation: outcome
                .operation
                .map(|op| entry.registry.operation_to_caller(&op)),
        })
    }

    /// Close a session. Returns whether anything was closed.
    pub fn close_session(&self, caller: CallerId, session_id: SessionId) -> bool {
        let Some(entry) = self.directory.get(caller) else {
            debug!(caller_id = %caller, session_id = %session_id, "close for unknown caller");
            return false;
        };
        match entry.registry.remove_session_by_caller_id(session_id) {
            Ok(bridge_id) => {
                info!(caller_id = %caller, session_id = %session_id, bridge_id = %bridge_id, "session closed");
                true
            }
            Err(e) => {
                debug!(caller_id = %caller, session_id = %session_id, error = %e, "close miss");
                false
            }
        }
    }

    pub fn invoke_command(
        &self,
        caller: CallerId,
        request: InvokeRequest,
    ) -> Result<CallResult, ProxyError> {
        let entry = self.caller(caller)?;
        let bridge_id = entry
            .registry
            .bridge_session_id(request.session_id)
            .ok_or_else(|| {
                ProxyError::BadParameters(format!("session {} is not open", request.session_id))
            })?;

        let operation = Self::to_bridge(&entry, request.operation.as_ref())?;
        let pending = self
            .pending
            .begin(caller, request.operation_id)
            .map_err(|e| ProxyError::BadParameters(e.to_string()))?;

        debug!(caller_id = %caller, session_id = %request.session_id, bridge_id = %bridge_id, command_id = request.command_id, operation_key = %pending.key(), "invoking command");
        let outcome = self.bridge.invoke_command(InvokeCall {
            session: bridge_id,
            command_id: request.command_id,
            operation: operation.as_ref(),
            key: pending.key(),
        });
        drop(pending);

        if outcome.return_code.is_cancel() {
            info!(caller_id = %caller, session_id = %request.session_id, command_id = request.command_id, "command cancelled");
        }

        Ok(CallResult {
            return_code: outcome.return_code,
            return_origin: outcome.return_origin,
            operation: outcome
                .operation
                .map(|op| entry.registry.operation_to_caller(&op)),
        })
    }

    /// Ask the engine to cancel a pending operation.
    ///
    /// Returns whether a pending operation matched; a miss is silent.
    pub fn request_cancellation(&self, caller: CallerId, operation_id: ClientOperationId) -> bool {
        match self.pending.lookup(caller, operation_id) {
            Some(key) => {
                info!(caller_id = %caller, operation_id = %operation_id, operation_key = %key, "requesting cancellation");
                self.bridge.request_cancellation(key);
                true
            }
            None => {
                debug!(caller_id = %caller, operation_id = %operation_id, "no pending operation to cancel");
                false
            }
        }
    }

    pub fn caller_summaries(&self) -> Vec<CallerSummary> {
        self.directory
            .callers()
            .into_iter()
            .map(|entry| CallerSummary {
                caller: entry.id,
                sessions: entry.registry.session_count(),
                shared_memory: entry.registry.shared_memory_count(),
                connected_at: entry.connected_at,
            })
            .collect()
    }

    pub fn callers(&self) -> Vec<CallerId> {
        self.directory.callers().into_iter().map(|entry| entry.id).collect()
    }

    pub fn is_connected(&self) -> bool {
        self.directory.is_connected()
    }

    pub fn context_token(&self) -> Option<ContextToken> {
        self.directory.context_token()
    }

    pub fn max_shared_memory(&self) -> usize {
        self.max_shared_memory
    }

    pub fn pending_operations(&self) -> usize {
        self.pending.len()
    }

    /// Tear down every caller and finalize the engine context.
    pub fn shutdown(&self) -> usize {
        let callers = self.directory.shutdown();
        info!(callers, "proxy shut down");
        callers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::BridgeSessionId;
    use crate::registry::{IdSpace, ResourceKind};

    #[test]
    fn error_codes_and_origins() {
        assert_eq!(
            ProxyError::UnknownCaller(CallerId(1)).return_code(),
            ReturnCode::ACCESS_DENIED
        );
        assert_eq!(
            ProxyError::OutOfMemory { size: 2, limit: 1 }.return_code(),
            ReturnCode::OUT_OF_MEMORY
        );

        let duplicate = ProxyError::from(RegistryError::DuplicateId {
            kind: ResourceKind::Session,
            space: IdSpace::Bridge,
            id: BridgeSessionId(3).0,
        });
        assert_eq!(duplicate.return_code(), ReturnCode::BAD_PARAMETERS);
        assert_eq!(duplicate.return_origin(), ReturnOrigin::Api);

        let transport = ProxyError::from(BridgeError::Context("down".into()));
        assert_eq!(transport.return_code(), ReturnCode::COMMUNICATION);
        assert_eq!(transport.return_origin(), ReturnOrigin::Comms);
    }
}
