// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
};

use super::extractor::CallerIdentity;
use crate::{error::ErrorBody, ids::ClientOperationId, state::AppState};

/// Request cancellation of a pending open or invoke.
///
/// Always accepted: the operation may already have finished, in which case
/// nothing happens. A cancellation is observed only when the pending call
/// returns `TEEC_ERROR_CANCEL`.
#[utoipa::path(
    post,
    path = "/v1/operations/{operation_id}/cancel",
    params(
        ("operation_id" = u32, Path, description = "Operation id given to open or invoke"),
        ("x-caller-id" = u32, Header, description = "Caller process id")
    ),
    tag = "Sessions",
    responses((status = 202), (status = 401, body = ErrorBody))
)]
pub async fn request_cancellation(
    Path(operation_id): Path<u32>,
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
) -> StatusCode {
    let proxy = Arc::clone(&state.proxy);
    state.dispatcher.spawn_detached(move || {
        proxy.request_cancellation(caller, ClientOperationId(operation_id));
    });
    StatusCode::ACCEPTED
}
