// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Native Bridge
//!
//! The only component allowed to cross into the TEE engine. Every call is
//! synchronous and may block for as long as the engine or the Trusted
//! Application takes; callers run these calls on blocking workers (see
//! [`crate::dispatch`]).
//!
//! ## Call contract
//!
//! | Call | Failure policy |
//! |------|----------------|
//! | `initialize_context` | `BridgeError::Context` |
//! | `finalize_context` | none, called at most once per token |
//! | `register_shared_memory` | `BridgeError::SharedMemory` |
//! | `release_shared_memory` | best-effort, callers log and continue |
//! | `open_session` | engine failure via return code |
//! | `close_session` | best-effort, callers log and continue |
//! | `invoke_command` | engine failure via return code |
//! | `request_cancellation` | fire-and-forget |
//!
//! ## Implementations
//!
//! - [`SocketBridge`] talks to an engine listening on a Unix socket.
//! - [`LoopbackBridge`] is an in-process engine for development and tests.

use std::io;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{BridgeMemoryId, BridgeSessionId, ContextToken, MemoryId, OperationKey, SessionId};
use crate::tee::{ConnectionMethod, MemoryFlags, Operation, ReturnCode, ReturnOrigin};

pub mod loopback;
pub mod socket;

pub use loopback::{BridgeCall, LoopbackBridge};
pub use socket::SocketBridge;

/// Errors surfaced by the bridge itself (as opposed to engine return codes).
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Context error: {0}")]
    Context(String),

    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    #[error("Unknown bridge handle: {0}")]
    UnknownHandle(String),

    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Arguments of an `open_session` call.
#[derive(Debug, Clone, Copy)]
pub struct OpenSessionCall<'a> {
    /// Caller-facing id, passed through for engine-side diagnostics.
    pub session_id: SessionId,
    pub trusted_app: Uuid,
    pub connection_method: ConnectionMethod,
    pub connection_data: u32,
    /// Operation with registered memory references already in bridge ids.
    pub operation: Option<&'a Operation>,
    pub key: OperationKey,
}

/// Result of an `open_session` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutcome {
    /// Present only when `return_code` is success.
    pub bridge_id: Option<BridgeSessionId>,
    pub return_code: ReturnCode,
    pub return_origin: ReturnOrigin,
    pub operation: Option<Operation>,
}

impl SessionOutcome {
    pub fn failed(return_code: ReturnCode, return_origin: ReturnOrigin) -> Self {
        Self {
            bridge_id: None,
            return_code,
            return_origin,
            operation: None,
        }
    }
}

/// Arguments of an `invoke_command` call.
#[derive(Debug, Clone, Copy)]
pub struct InvokeCall<'a> {
    pub session: BridgeSessionId,
    pub command_id: u32,
    pub operation: Option<&'a Operation>,
    pub key: OperationKey,
}

/// Result of an `invoke_command` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeOutcome {
    pub return_code: ReturnCode,
    pub return_origin: ReturnOrigin,
    pub operation: Option<Operation>,
}

impl InvokeOutcome {
    pub fn failed(return_code: ReturnCode, return_origin: ReturnOrigin) -> Self {
        Self {
            return_code,
            return_origin,
            operation: None,
        }
    }
}

/// Synchronous call surface of the TEE engine.
pub trait NativeBridge: Send + Sync {
    fn initialize_context(
        &self,
        tee_name: Option<&str>,
        transport: &str,
    ) -> Result<ContextToken, BridgeError>;

    fn finalize_context(&self, token: ContextToken);

    fn register_shared_memory(
        &self,
        buffer: &[u8],
        flags: MemoryFlags,
        memory_id: MemoryId,
    ) -> Result<BridgeMemoryId, BridgeError>;

    fn release_shared_memory(&self, bridge_id: BridgeMemoryId) -> Result<(), BridgeError>;

    fn open_session(&self, call: OpenSessionCall<'_>) -> SessionOutcome;

    fn close_session(&self, bridge_id: BridgeSessionId) -> Result<(), BridgeError>;

    fn invoke_command(&self, call: InvokeCall<'_>) -> InvokeOutcome;

    fn request_cancellation(&self, key: OperationKey);
}
