// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, Request},
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info_span;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    error::ErrorBody,
    models::{
        CallerSummaryResponse, CallersResponse, ContextResponse, FinalizeContextResponse,
        InitializeContextRequest, InvokeCommandRequest, OpenSessionRequest, OperationResponse,
        RegisterSharedMemoryRequest, SharedMemoryResponse,
    },
    state::AppState,
    tee::{ConnectionMethod, Direction, Operation, Parameter, ReturnOrigin},
};

pub mod admin;
pub mod context;
pub mod extractor;
pub mod health;
pub mod operations;
pub mod sessions;
pub mod shared_memory;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Room for the JSON around a base64 buffer.
const BODY_OVERHEAD: usize = 64 * 1024;

/// Largest request body: a base64 buffer of `max_shared_memory` bytes plus envelope.
pub fn body_limit(max_shared_memory: usize) -> usize {
    max_shared_memory
        .div_ceil(3)
        .saturating_mul(4)
        .saturating_add(BODY_OVERHEAD)
}

pub fn router(state: AppState) -> Router {
    let limit = body_limit(state.proxy.max_shared_memory());
    let v1_routes = Router::new()
        .route(
            "/context",
            post(context::initialize_context).delete(context::finalize_context),
        )
        .route("/shared-memory", post(shared_memory::register_shared_memory))
        .route(
            "/shared-memory/{memory_id}",
            delete(shared_memory::release_shared_memory),
        )
        .route("/sessions", post(sessions::open_session))
        .route("/sessions/{session_id}", delete(sessions::close_session))
        .route(
            "/sessions/{session_id}/invoke",
            post(sessions::invoke_command),
        )
        .route(
            "/operations/{operation_id}/cancel",
            post(operations::request_cancellation),
        )
        .route("/admin/callers", get(admin::list_callers))
        .layer(DefaultBodyLimit::max(limit))
        .with_state(state.clone());

    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .with_state(state);

    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    let observability = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");
                info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            }),
        )
        .layer(PropagateRequestIdLayer::new(request_id));

    Router::new()
        .nest("/v1", v1_routes)
        .merge(health_routes)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(observability)
        .layer(CorsLayer::permissive())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        context::initialize_context,
        context::finalize_context,
        shared_memory::register_shared_memory,
        shared_memory::release_shared_memory,
        sessions::open_session,
        sessions::close_session,
        sessions::invoke_command,
        operations::request_cancellation,
        admin::list_callers,
        health::health,
        health::liveness,
        health::readiness
    ),
    components(
        schemas(
            InitializeContextRequest,
            ContextResponse,
            FinalizeContextResponse,
            RegisterSharedMemoryRequest,
            SharedMemoryResponse,
            OpenSessionRequest,
            InvokeCommandRequest,
            OperationResponse,
            CallerSummaryResponse,
            CallersResponse,
            ErrorBody,
            Operation,
            Parameter,
            Direction,
            ConnectionMethod,
            ReturnOrigin,
            health::ReadyResponse,
            health::HealthChecks,
            health::HealthResponse
        )
    ),
    tags(
        (name = "Context", description = "Caller connection to the TEE engine"),
        (name = "Shared Memory", description = "Buffers shared with Trusted Applications"),
        (name = "Sessions", description = "Sessions, command invocation and cancellation"),
        (name = "Admin", description = "Diagnostics"),
        (name = "Health", description = "Liveness and readiness probes")
    )
)]
pub struct ApiDoc;
