// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Request extractors.
//!
//! Every caller-facing route identifies the Client Application by the
//! `x-caller-id` header, a decimal process id. Request bodies go through
//! [`Payload`], which answers malformed or oversized bodies with an
//! [`ApiError`] body like every other failure.
//!
//! ```rust,ignore
//! async fn handler(CallerIdentity(caller): CallerIdentity, Payload(body): Payload<Body>) { ... }
//! ```

use axum::{
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Request},
    http::request::Parts,
    Json,
};

use crate::config::CALLER_ID_HEADER;
use crate::error::ApiError;
use crate::ids::CallerId;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerIdentity(pub CallerId);

impl FromRequestParts<AppState> for CallerIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &AppState) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(CALLER_ID_HEADER)
            .ok_or_else(|| ApiError::unauthorized(format!("missing {CALLER_ID_HEADER} header")))?
            .to_str()
            .map_err(|_| ApiError::unauthorized(format!("invalid {CALLER_ID_HEADER} header")))?;

        let id: u32 = raw
            .trim()
            .parse()
            .map_err(|_| ApiError::unauthorized(format!("invalid {CALLER_ID_HEADER} header")))?;

        Ok(CallerIdentity(CallerId(id)))
    }
}

/// JSON request body.
#[derive(Debug, Clone, Copy, Default)]
pub struct Payload<T>(pub T);

impl<T, S> FromRequest<S> for Payload<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(request, state).await?;
        Ok(Payload(value))
    }
}
