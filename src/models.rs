// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # API Data Models
//!
//! Request and response bodies of the REST API. All types derive `Serialize`
//! and/or `Deserialize` plus `ToSchema` for JSON handling and OpenAPI
//! documentation.
//!
//! ## Identifiers
//!
//! Every id in these bodies is caller-facing: the Client Application picks
//! session, shared memory and operation ids, and never sees the ids the
//! engine assigned.
//!
//! ## Model Categories
//!
//! - **Context**: connecting and disconnecting a caller
//! - **Shared Memory**: registering buffers with the engine
//! - **Sessions**: opening sessions and invoking commands
//! - **Admin**: diagnostics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::proxy::{CallResult, CallerSummary};
use crate::registry::SharedMemoryRegion;
use crate::tee::{optional_base64_bytes, ConnectionMethod, MemoryFlags, Operation, ReturnCode, ReturnOrigin};

// =============================================================================
// Context
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct InitializeContextRequest {
    /// TEE to connect to. Omit for the configured default.
    #[serde(default)]
    pub tee_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct ContextResponse {
    pub caller_id: u32,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct FinalizeContextResponse {
    pub caller_id: u32,
    /// False when the caller had no context.
    pub finalized: bool,
    /// Sessions the caller left open.
    pub sessions_closed: usize,
    /// Shared memory regions the caller left registered.
    pub shared_memory_released: usize,
}

// =============================================================================
// Shared Memory
// =============================================================================

/// Register a buffer, or allocate a zeroed one of `size` bytes.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterSharedMemoryRequest {
    pub memory_id: u32,
    /// Bit vector: 1 = input, 2 = output, 3 = both.
    #[schema(value_type = u32)]
    pub flags: MemoryFlags,
    /// Base64 contents. Takes precedence over `size`.
    #[serde(default, with = "optional_base64_bytes")]
    #[schema(value_type = Option<String>, format = Byte)]
    pub buffer: Option<Vec<u8>>,
    #[serde(default)]
    pub size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct SharedMemoryResponse {
    pub memory_id: u32,
    pub handle: Uuid,
    #[schema(value_type = u32)]
    pub flags: MemoryFlags,
    pub size: usize,
}

impl From<&SharedMemoryRegion> for SharedMemoryResponse {
    fn from(region: &SharedMemoryRegion) -> Self {
        Self {
            memory_id: region.id.0,
            handle: region.handle,
            flags: region.flags,
            size: region.size,
        }
    }
}

// =============================================================================
// Sessions
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OpenSessionRequest {
    pub session_id: u32,
    pub trusted_app: Uuid,
    #[serde(default)]
    pub connection_method: ConnectionMethod,
    #[serde(default)]
    pub connection_data: u32,
    #[serde(default)]
    pub operation: Option<Operation>,
    /// Id the caller can later pass to the cancel endpoint.
    #[serde(default)]
    pub operation_id: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InvokeCommandRequest {
    pub command_id: u32,
    #[serde(default)]
    pub operation: Option<Operation>,
    #[serde(default)]
    pub operation_id: Option<u32>,
}

/// Engine result of an open or invoke call.
///
/// Returned with HTTP 200 whatever the return code; HTTP errors are reserved
/// for requests the proxy itself rejects.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct OperationResponse {
    #[schema(value_type = u32)]
    pub return_code: ReturnCode,
    /// Symbolic name of `return_code`, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_code_name: Option<String>,
    pub return_origin: ReturnOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
}

impl From<CallResult> for OperationResponse {
    fn from(result: CallResult) -> Self {
        Self {
            return_code_name: result.return_code.name().map(str::to_owned),
            return_code: result.return_code,
            return_origin: result.return_origin,
            operation: result.operation,
        }
    }
}

// =============================================================================
// Admin
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct CallerSummaryResponse {
    pub caller_id: u32,
    pub sessions: usize,
    pub shared_memory: usize,
    pub connected_at: DateTime<Utc>,
}

impl From<CallerSummary> for CallerSummaryResponse {
    fn from(summary: CallerSummary) -> Self {
        Self {
            caller_id: summary.caller.0,
            sessions: summary.sessions,
            shared_memory: summary.shared_memory,
            connected_at: summary.connected_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CallersResponse {
    pub engine_connected: bool,
    pub callers: Vec<CallerSummaryResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_request_accepts_buffer_or_size() {
        let with_buffer: RegisterSharedMemoryRequest =
            serde_json::from_str(r#"{"memory_id":1,"flags":3,"buffer":"AQID"}"#).unwrap();
        assert_eq!(with_buffer.buffer, Some(vec![1, 2, 3]));
        assert_eq!(with_buffer.flags, MemoryFlags::INOUT);

        let with_size: RegisterSharedMemoryRequest =
            serde_json::from_str(r#"{"memory_id":2,"flags":1,"size":16}"#).unwrap();
        assert_eq!(with_size.buffer, None);
        assert_eq!(with_size.size, Some(16));
    }

    #[test]
    fn operation_response_names_known_codes() {
        let response = OperationResponse::from(CallResult {
            return_code: ReturnCode::CANCEL,
            return_origin: ReturnOrigin::Tee,
            operation: None,
        });
        assert_eq!(response.return_code_name.as_deref(), Some("TEEC_ERROR_CANCEL"));

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["return_code"], 0xFFFF_0002u32);
        assert_eq!(json["return_origin"], "tee");
        assert!(json.get("operation").is_none());
    }

    #[test]
    fn open_session_request_defaults() {
        let request: OpenSessionRequest = serde_json::from_str(
            r#"{"session_id":1,"trusted_app":"00000000-0000-0000-0000-000000000001"}"#,
        )
        .unwrap();
        assert_eq!(request.connection_method, ConnectionMethod::Public);
        assert!(request.operation.is_none());
        assert!(request.operation_id.is_none());
    }
}
