// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::{net::SocketAddr, sync::Arc};

use tee_proxy_server::{
    api::router,
    bridge::{LoopbackBridge, NativeBridge, SocketBridge},
    config::{BridgeKind, LogFormat, ProxyConfig},
    directory::DirectorySettings,
    logging,
    proxy::ProxySettings,
    reaper::CallerReaper,
    state::AppState,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    logging::init(LogFormat::from_env()).expect("Failed to install tracing subscriber");

    let config = ProxyConfig::from_env();
    info!(?config, "loaded configuration");

    let bridge: Arc<dyn NativeBridge> = match config.bridge {
        BridgeKind::Socket => Arc::new(SocketBridge::new()),
        BridgeKind::Loopback => {
            warn!("using the in-process loopback engine; no real TEE is attached");
            Arc::new(LoopbackBridge::new())
        }
    };

    let settings = ProxySettings {
        directory: DirectorySettings {
            tee_name: config.tee_name.clone(),
            transport: config.transport.clone(),
            finalize_when_idle: config.finalize_when_idle,
        },
        max_shared_memory: config.max_shared_memory,
    };
    let state = AppState::with_bridge(bridge, settings, config.max_inflight_calls);

    let shutdown = CancellationToken::new();
    let reaper = config.reap_interval.map(|interval| {
        let reaper = CallerReaper::new(
            Arc::clone(&state.proxy),
            state.dispatcher.clone(),
            interval,
        );
        tokio::spawn(reaper.run(shutdown.clone()))
    });

    let addr: SocketAddr = config
        .bind_address()
        .parse()
        .expect("Failed to parse bind address");
    let listener = TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");

    info!(%addr, transport = %config.transport, "TEE proxy listening (docs at /docs)");

    let app = router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("HTTP server failed");

    shutdown.cancel();
    if let Some(reaper) = reaper {
        if let Err(e) = reaper.await {
            warn!(error = %e, "caller reaper task failed");
        }
    }

    state.dispatcher.close();
    let proxy = Arc::clone(&state.proxy);
    match tokio::task::spawn_blocking(move || proxy.shutdown()).await {
        Ok(callers) => info!(callers, "shutdown complete"),
        Err(e) => warn!(error = %e, "teardown on shutdown failed"),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
