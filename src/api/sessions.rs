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
    ids::{ClientOperationId, SessionId},
    models::{InvokeCommandRequest, OpenSessionRequest, OperationResponse},
    proxy::{InvokeRequest, OpenSessionRequest as ProxyOpenSession},
    state::AppState,
};

#[utoipa::path(
    post,
    path = "/v1/sessions",
    request_body = OpenSessionRequest,
    params(("x-caller-id" = u32, Header, description = "Caller process id")),
    tag = "Sessions",
    responses(
        (status = 200, description = "Engine result, success or not", body = OperationResponse),
        (status = 400, description = "Session id in use or unknown memory reference", body = ErrorBody),
        (status = 403, description = "Caller has no context", body = ErrorBody)
    )
)]
pub async fn open_session(
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
    Payload(request): Payload<OpenSessionRequest>,
) -> Result<Json<OperationResponse>, ApiError> {
    let proxy = Arc::clone(&state.proxy);
    let request = ProxyOpenSession {
        session_id: SessionId(request.session_id),
        trusted_app: request.trusted_app,
        connection_method: request.connection_method,
        connection_data: request.connection_data,
        operation: request.operation,
        operation_id: request.operation_id.map(ClientOperationId),
    };
    let result = state
        .dispatcher
        .run(move || proxy.open_session(caller, request))
        .await??;
    Ok(Json(result.into()))
}

#[utoipa::path(
    delete,
    path = "/v1/sessions/{session_id}",
    params(
        ("session_id" = u32, Path, description = "Caller-facing session id"),
        ("x-caller-id" = u32, Header, description = "Caller process id")
    ),
    tag = "Sessions",
    responses((status = 204), (status = 401, body = ErrorBody))
)]
pub async fn close_session(
    Path(session_id): Path<u32>,
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
) -> Result<StatusCode, ApiError> {
    let proxy = Arc::clone(&state.proxy);
    state
        .dispatcher
        .run(move || proxy.close_session(caller, SessionId(session_id)))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/invoke",
    request_body = InvokeCommandRequest,
    params(
        ("session_id" = u32, Path, description = "Caller-facing session id"),
        ("x-caller-id" = u32, Header, description = "Caller process id")
    ),
    tag = "Sessions",
    responses(
        (status = 200, description = "Engine result, success or not", body = OperationResponse),
        (status = 400, description = "Unknown session or memory reference", body = ErrorBody),
        (status = 403, description = "Caller has no context", body = ErrorBody)
    )
)]
pub async fn invoke_command(
    Path(session_id): Path<u32>,
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
    Payload(request): Payload<InvokeCommandRequest>,
) -> Result<Json<OperationResponse>, ApiError> {
    let proxy = Arc::clone(&state.proxy);
    let request = InvokeRequest {
        session_id: SessionId(session_id),
        command_id: request.command_id,
        operation: request.operation,
        operation_id: request.operation_id.map(ClientOperationId),
    };
    let result = state
        .dispatcher
        .run(move || proxy.invoke_command(caller, request))
        .await??;
    Ok(Json(result.into()))
}
