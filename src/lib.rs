// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! TEE Proxy Server - Client Application Session Multiplexer
//!
//! Sits between Client Applications and a GlobalPlatform style TEE engine.
//! Each caller gets its own context, sessions and shared memory; the proxy
//! keeps the caller-facing ids apart from the engine's own ids and tears
//! everything down when a caller finalizes or disappears.
//!
//! ## Modules
//!
//! - `api` - HTTP API handlers (Axum)
//! - `bridge` - Native bridge to the engine (socket transport, loopback engine)
//! - `registry` - Per-caller bidirectional id maps
//! - `directory` - Connected callers and the shared engine context
//! - `ownership` - Resource ownership tree driving teardown
//! - `proxy` - Caller operations on top of the directory and the bridge

pub mod api;
pub mod bimap;
pub mod bridge;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod ids;
pub mod logging;
pub mod models;
pub mod ownership;
pub mod pending;
pub mod proxy;
pub mod reaper;
pub mod registry;
pub mod state;
pub mod tee;
