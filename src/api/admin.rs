// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Diagnostics for operators.

use axum::{extract::State, Json};

use crate::{
    models::{CallerSummaryResponse, CallersResponse},
    state::AppState,
};

#[utoipa::path(
    get,
    path = "/v1/admin/callers",
    tag = "Admin",
    responses((status = 200, body = CallersResponse))
)]
pub async fn list_callers(State(state): State<AppState>) -> Json<CallersResponse> {
    Json(CallersResponse {
        engine_connected: state.proxy.is_connected(),
        callers: state
            .proxy
            .caller_summaries()
            .into_iter()
            .map(CallerSummaryResponse::from)
            .collect(),
    })
}
