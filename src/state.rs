// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use crate::bridge::{LoopbackBridge, NativeBridge};
use crate::dispatch::Dispatcher;
use crate::proxy::{ProxySettings, TeeProxy};

#[derive(Clone)]
pub struct AppState {
    pub proxy: Arc<TeeProxy>,
    pub dispatcher: Dispatcher,
}

impl AppState {
    pub fn new(proxy: TeeProxy, dispatcher: Dispatcher) -> Self {
        Self {
            proxy: Arc::new(proxy),
            dispatcher,
        }
    }

    pub fn with_bridge(bridge: Arc<dyn NativeBridge>, settings: ProxySettings, max_inflight: usize) -> Self {
        Self::new(TeeProxy::new(bridge, settings), Dispatcher::new(max_inflight))
    }
}

impl Default for AppState {
    /// In-process loopback engine with default limits.
    fn default() -> Self {
        Self::new(
            TeeProxy::new(Arc::new(LoopbackBridge::new()), ProxySettings::default()),
            Dispatcher::default(),
        )
    }
}
