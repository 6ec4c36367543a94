// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use super::extractor::{CallerIdentity, Payload};
use crate::{
    error::{ApiError, ErrorBody},
    ids::MemoryId,
    models::{RegisterSharedMemoryRequest, SharedMemoryResponse},
    proxy::ProxyError,
    state::AppState,
};

#[utoipa::path(
    post,
    path = "/v1/shared-memory",
    request_body = RegisterSharedMemoryRequest,
    params(("x-caller-id" = u32, Header, description = "Caller process id")),
    tag = "Shared Memory",
    responses(
        (status = 201, body = SharedMemoryResponse),
        (status = 400, description = "Duplicate id, bad flags or no buffer", body = ErrorBody),
        (status = 403, description = "Caller has no context", body = ErrorBody),
        (status = 413, body = ErrorBody)
    )
)]
pub async fn register_shared_memory(
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
    Payload(request): Payload<RegisterSharedMemoryRequest>,
) -> Result<(StatusCode, Json<SharedMemoryResponse>), ApiError> {
    let buffer = match (request.buffer, request.size) {
        (Some(buffer), _) => buffer,
        (None, Some(size)) => {
            let limit = state.proxy.max_shared_memory();
            if size > limit {
                return Err(ProxyError::OutOfMemory { size, limit }.into());
            }
            vec![0; size]
        }
        (None, None) => return Err(ApiError::bad_request("either buffer or size is required")),
    };

    let proxy = Arc::clone(&state.proxy);
    let memory_id = MemoryId(request.memory_id);
    let flags = request.flags;
    let region = state
        .dispatcher
        .run(move || proxy.register_shared_memory(caller, memory_id, flags, &buffer))
        .await??;

    Ok((StatusCode::CREATED, Json(SharedMemoryResponse::from(region.as_ref()))))
}

#[utoipa::path(
    delete,
    path = "/v1/shared-memory/{memory_id}",
    params(
        ("memory_id" = u32, Path, description = "Caller-facing shared memory id"),
        ("x-caller-id" = u32, Header, description = "Caller process id")
    ),
    tag = "Shared Memory",
    responses((status = 204), (status = 401, body = ErrorBody))
)]
pub async fn release_shared_memory(
    Path(memory_id): Path<u32>,
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
) -> Result<StatusCode, ApiError> {
    let proxy = Arc::clone(&state.proxy);
    state
        .dispatcher
        .run(move || proxy.release_shared_memory(caller, MemoryId(memory_id)))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::CallerId;
    use crate::tee::{MemoryFlags, ReturnCode};

    fn request(memory_id: u32, buffer: Option<Vec<u8>>, size: Option<usize>) -> RegisterSharedMemoryRequest {
        RegisterSharedMemoryRequest {
            memory_id,
            flags: MemoryFlags::INOUT,
            buffer,
            size,
        }
    }

    fn connected(caller: u32) -> AppState {
        let state = AppState::default();
        state
            .proxy
            .initialize_context(CallerId(caller), None)
            .unwrap();
        state
    }

    #[tokio::test]
    async fn register_and_release() {
        let state = connected(7);
        let (status, Json(region)) = register_shared_memory(
            State(state.clone()),
            CallerIdentity(CallerId(7)),
            Payload(request(1, Some(b"hello".to_vec()), None)),
        )
        .await
        .expect("registration succeeds");

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(region.memory_id, 1);
        assert_eq!(region.size, 5);
        assert_eq!(state.proxy.caller_summaries()[0].shared_memory, 1);

        let status = release_shared_memory(Path(1), State(state.clone()), CallerIdentity(CallerId(7)))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.proxy.caller_summaries()[0].shared_memory, 0);

        // Releasing again is tolerated.
        let status = release_shared_memory(Path(1), State(state), CallerIdentity(CallerId(7)))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn allocate_by_size() {
        let state = connected(8);
        let (_, Json(region)) = register_shared_memory(
            State(state),
            CallerIdentity(CallerId(8)),
            Payload(request(2, None, Some(64))),
        )
        .await
        .unwrap();
        assert_eq!(region.size, 64);
    }

    #[tokio::test]
    async fn rejections() {
        let state = connected(9);

        let err = register_shared_memory(
            State(state.clone()),
            CallerIdentity(CallerId(9)),
            Payload(request(1, None, None)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = register_shared_memory(
            State(state.clone()),
            CallerIdentity(CallerId(9)),
            Payload(request(1, None, Some(usize::MAX))),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::PAYLOAD_TOO_LARGE);

        let err = register_shared_memory(
            State(state.clone()),
            CallerIdentity(CallerId(404)),
            Payload(request(1, Some(vec![1]), None)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(err.return_code, Some(ReturnCode::ACCESS_DENIED));

        register_shared_memory(
            State(state.clone()),
            CallerIdentity(CallerId(9)),
            Payload(request(3, Some(vec![1]), None)),
        )
        .await
        .unwrap();
        let err = register_shared_memory(
            State(state),
            CallerIdentity(CallerId(9)),
            Payload(request(3, Some(vec![2]), None)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.return_code, Some(ReturnCode::BAD_PARAMETERS));
    }
}
