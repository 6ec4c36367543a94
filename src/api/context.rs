// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use axum::{extract::State, Json};

use super::extractor::{CallerIdentity, Payload};
use crate::{
    error::{ApiError, ErrorBody},
    models::{ContextResponse, FinalizeContextResponse, InitializeContextRequest},
    state::AppState,
};

#[utoipa::path(
    post,
    path = "/v1/context",
    request_body = InitializeContextRequest,
    params(("x-caller-id" = u32, Header, description = "Caller process id")),
    tag = "Context",
    responses(
        (status = 200, body = ContextResponse),
        (status = 401, body = ErrorBody),
        (status = 502, description = "Engine unreachable or TEE mismatch", body = ErrorBody)
    )
)]
pub async fn initialize_context(
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
    Payload(request): Payload<InitializeContextRequest>,
) -> Result<Json<ContextResponse>, ApiError> {
    let proxy = Arc::clone(&state.proxy);
    let connected_at = state
        .dispatcher
        .run(move || proxy.initialize_context(caller, request.tee_name.as_deref()))
        .await??;

    Ok(Json(ContextResponse {
        caller_id: caller.0,
        connected_at,
    }))
}

#[utoipa::path(
    delete,
    path = "/v1/context",
    params(("x-caller-id" = u32, Header, description = "Caller process id")),
    tag = "Context",
    responses(
        (status = 200, body = FinalizeContextResponse),
        (status = 401, body = ErrorBody)
    )
)]
pub async fn finalize_context(
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
) -> Result<Json<FinalizeContextResponse>, ApiError> {
    let proxy = Arc::clone(&state.proxy);
    let report = state
        .dispatcher
        .run(move || proxy.finalize_context(caller))
        .await?;

    Ok(Json(FinalizeContextResponse {
        caller_id: caller.0,
        finalized: report.is_some(),
        sessions_closed: report.map_or(0, |r| r.sessions),
        shared_memory_released: report.map_or(0, |r| r.regions),
    }))
}
