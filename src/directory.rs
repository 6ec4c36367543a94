// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Caller Directory
//!
//! Process-wide table of connected callers and owner of the engine context.
//!
//! The engine context is initialized when the first caller connects. Every
//! caller's registry hangs off the context node, so finalizing the context
//! tears down anything still registered beneath it before the bridge's
//! `finalize_context` runs (exactly once per token).
//!
//! Lock order: context mutex, then the caller table. Neither is held across a
//! registry teardown. Once [`CallerDirectory::shutdown`] has run the
//! directory refuses new callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::bridge::{BridgeError, NativeBridge};
use crate::ids::{CallerId, ContextToken};
use crate::ownership::ResourceNode;
use crate::registry::{CallerRegistry, TeardownReport};

/// Engine connection parameters.
#[derive(Debug, Clone, Default)]
pub struct DirectorySettings {
    /// TEE to connect to when a caller does not name one.
    pub tee_name: Option<String>,
    pub transport: String,
    /// Finalize the engine context as soon as the last caller leaves.
    pub finalize_when_idle: bool,
}

/// One connected Client Application.
#[derive(Debug)]
pub struct Caller {
    pub id: CallerId,
    pub registry: CallerRegistry,
    pub connected_at: DateTime<Utc>,
}

struct EngineContext {
    token: ContextToken,
    tee_name: Option<String>,
    node: Arc<ResourceNode>,
}

pub struct CallerDirectory {
    bridge: Arc<dyn NativeBridge>,
    settings: DirectorySettings,
    callers: RwLock<HashMap<CallerId, Arc<Caller>>>,
    context: Mutex<Option<EngineContext>>,
    /// Set under the context mutex by `shutdown`.
    closed: AtomicBool,
}

/// Blank TEE names mean the default TEE.
fn normalize_tee_name(name: Option<&str>) -> Option<&str> {
    name.map(str::trim).filter(|name| !name.is_empty())
}

fn describe_tee(name: Option<&str>) -> String {
    match name {
        Some(name) => format!("TEE {name:?}"),
        None => "the default TEE".to_string(),
    }
}

impl CallerDirectory {
    pub fn new(bridge: Arc<dyn NativeBridge>, settings: DirectorySettings) -> Self {
        Self {
            bridge,
            settings,
            callers: RwLock::new(HashMap::new()),
            context: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn lock_context(&self) -> MutexGuard<'_, Option<EngineContext>> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a connected caller.
    pub fn get(&self, caller: CallerId) -> Option<Arc<Caller>> {
        self.callers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&caller)
            .cloned()
    }

    /// Connect a caller, initializing the engine context on first use.
    ///
    /// Connecting an already connected caller returns its existing entry.
    ///
    /// A blank `tee_name` is the same as none: the configured TEE, or the
    /// engine's default when none is configured.
    ///
    /// # Errors
    /// `BridgeError::Context` if the engine cannot be reached, the caller
    /// names a TEE other than the one already connected, or the directory
    /// has shut down.
    pub fn connect(
        &self,
        caller: CallerId,
        tee_name: Option<&str>,
    ) -> Result<Arc<Caller>, BridgeError> {
        if let Some(existing) = self.get(caller) {
            return Ok(existing);
        }

        let requested = normalize_tee_name(tee_name)
            .or_else(|| normalize_tee_name(self.settings.tee_name.as_deref()))
            .map(str::to_owned);

        let mut context = self.lock_context();
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::Context("proxy is shutting down".into()));
        }
        if context.is_none() {
            let token = self
                .bridge
                .initialize_context(requested.as_deref(), &self.settings.transport)?;
            let node = {
                let bridge = Arc::clone(&self.bridge);
                ResourceNode::new("context", move || {
                    bridge.finalize_context(token);
                    info!(token = %token, "engine context finalized");
                })
            };
            info!(token = %token, tee_name = ?requested, transport = %self.settings.transport, "engine context initialized");
            *context = Some(EngineContext {
                token,
                tee_name: requested.clone(),
                node,
            });
        }
        let Some(engine) = context.as_ref() else {
            return Err(BridgeError::Context("engine context unavailable".into()));
        };

        if requested.is_some() && requested != engine.tee_name {
            return Err(BridgeError::Context(format!(
                "engine context is open on {}; caller asked for {}. Omit tee_name or set {} to match",
                describe_tee(engine.tee_name.as_deref()),
                describe_tee(requested.as_deref()),
                crate::config::TEE_NAME_ENV,
            )));
        }

        let mut callers = self.callers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = callers.get(&caller) {
            return Ok(Arc::clone(existing));
        }

        let registry = CallerRegistry::new(caller, Arc::clone(&self.bridge));
        registry
            .node()
            .attach(&engine.node)
            .map_err(|e| BridgeError::Context(e.to_string()))?;

        let entry = Arc::new(Caller {
            id: caller,
            registry,
            connected_at: Utc::now(),
        });
        callers.insert(caller, Arc::clone(&entry));
        info!(caller_id = %caller, callers = callers.len(), "caller connected");
        Ok(entry)
    }

    /// Remove a caller and tear down everything it still holds.
    ///
    /// Returns `None` for callers that are not connected.
    pub fn disconnect(&self, caller: CallerId) -> Option<TeardownReport> {
        let entry = self
            .callers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&caller)?;

        let report = entry.registry.destroy();
        if report.sessions > 0 || report.regions > 0 {
            warn!(
                caller_id = %caller,
                sessions = report.sessions,
                shared_memory = report.regions,
                "caller left resources open; released them"
            );
        }
        info!(caller_id = %caller, "caller disconnected");

        if self.settings.finalize_when_idle {
            self.finalize_if_idle();
        }
        Some(report)
    }

    fn finalize_if_idle(&self) {
        let engine = {
            let mut context = self.lock_context();
            if !self.is_empty() {
                return;
            }
            context.take()
        };
        if let Some(engine) = engine {
            engine.node.destroy();
        }
    }

    /// Disconnect every caller, finalize the engine context and refuse
    /// further connections.
    pub fn shutdown(&self) -> usize {
        let (drained, engine) = {
            let mut context = self.lock_context();
            self.closed.store(true, Ordering::Release);
            let drained: Vec<Arc<Caller>> = self
                .callers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .drain()
                .map(|(_, entry)| entry)
                .collect();
            (drained, context.take())
        };

        for entry in &drained {
            let report = entry.registry.destroy();
            info!(
                caller_id = %entry.id,
                sessions = report.sessions,
                shared_memory = report.regions,
                "caller torn down at shutdown"
            );
        }

        if let Some(engine) = engine {
            engine.node.destroy();
        }
        drained.len()
    }

    pub fn callers(&self) -> Vec<Arc<Caller>> {
        let mut callers: Vec<_> = self
            .callers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        callers.sort_by_key(|entry| entry.id);
        callers
    }

    pub fn len(&self) -> usize {
        self.callers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_connected(&self) -> bool {
        self.lock_context().is_some()
    }

    pub fn context_token(&self) -> Option<ContextToken> {
        self.lock_context().as_ref().map(|engine| engine.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeCall, LoopbackBridge};
    use crate::ids::{BridgeSessionId, SessionId};

    fn directory(finalize_when_idle: bool) -> (Arc<LoopbackBridge>, CallerDirectory) {
        let bridge = Arc::new(LoopbackBridge::new().with_tee_names(["optee", "sgx"]));
        let directory = CallerDirectory::new(
            bridge.clone(),
            DirectorySettings {
                tee_name: None,
                transport: "loopback".into(),
                finalize_when_idle,
            },
        );
        (bridge, directory)
    }

    fn inits(bridge: &LoopbackBridge) -> usize {
        bridge.count_calls(|call| matches!(call, BridgeCall::InitializeContext { .. }))
    }

    fn finalizes(bridge: &LoopbackBridge) -> usize {
        bridge.count_calls(|call| matches!(call, BridgeCall::FinalizeContext(_)))
    }

    #[test]
    fn context_initialized_once_for_many_callers() {
        let (bridge, directory) = directory(false);
        let first = directory.connect(CallerId(10), None).unwrap();
        directory.connect(CallerId(11), None).unwrap();
        let again = directory.connect(CallerId(10), None).unwrap();

        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(inits(&bridge), 1);
        assert_eq!(directory.len(), 2);
    }

    #[test]
    fn mismatched_tee_name_is_rejected() {
        let (_bridge, directory) = directory(false);
        directory.connect(CallerId(1), Some("optee")).unwrap();
        assert!(directory.connect(CallerId(2), Some("optee")).is_ok());
        assert!(matches!(
            directory.connect(CallerId(3), Some("sgx")),
            Err(BridgeError::Context(_))
        ));
        assert!(directory.get(CallerId(3)).is_none());
    }

    #[test]
    fn blank_tee_name_means_the_default() {
        let (bridge, directory) = directory(false);
        directory.connect(CallerId(1), None).unwrap();
        directory.connect(CallerId(2), Some("")).unwrap();
        directory.connect(CallerId(3), Some("   ")).unwrap();
        assert_eq!(inits(&bridge), 1);
        assert_eq!(directory.len(), 3);
        assert_eq!(
            bridge.journal()[0],
            BridgeCall::InitializeContext { tee_name: None }
        );
    }

    #[test]
    fn named_tee_after_default_explains_the_mismatch() {
        let (_bridge, directory) = directory(false);
        directory.connect(CallerId(1), None).unwrap();

        let Err(BridgeError::Context(message)) = directory.connect(CallerId(2), Some("optee")) else {
            panic!("expected a context error");
        };
        assert!(message.contains("the default TEE"), "{message}");
        assert!(message.contains("\"optee\""), "{message}");
        assert!(message.contains(crate::config::TEE_NAME_ENV), "{message}");
    }

    #[test]
    fn configured_tee_applies_to_unnamed_callers() {
        let bridge = Arc::new(LoopbackBridge::new().with_tee_names(["optee"]));
        let directory = CallerDirectory::new(
            bridge.clone(),
            DirectorySettings {
                tee_name: Some("optee".into()),
                transport: "loopback".into(),
                finalize_when_idle: false,
            },
        );
        directory.connect(CallerId(1), Some(" ")).unwrap();
        directory.connect(CallerId(2), Some("optee")).unwrap();
        assert_eq!(
            bridge.journal()[0],
            BridgeCall::InitializeContext {
                tee_name: Some("optee".into())
            }
        );
    }

    #[test]
    fn failed_initialization_leaves_no_context() {
        let (_bridge, directory) = directory(false);
        assert!(directory.connect(CallerId(1), Some("missing")).is_err());
        assert!(!directory.is_connected());
        assert!(directory.is_empty());
    }

    #[test]
    fn disconnect_tears_down_registry() {
        let (bridge, directory) = directory(false);
        let caller = directory.connect(CallerId(5), None).unwrap();
        caller
            .registry
            .add_session(SessionId(1), BridgeSessionId(77))
            .unwrap();

        let report = directory.disconnect(CallerId(5)).unwrap();
        assert_eq!(report.sessions, 1);
        assert!(caller.registry.is_destroyed());
        assert_eq!(
            bridge.count_calls(|call| *call == BridgeCall::CloseSession(BridgeSessionId(77))),
            1
        );
        assert!(directory.disconnect(CallerId(5)).is_none());
        assert!(directory.is_connected());
        assert_eq!(finalizes(&bridge), 0);
    }

    #[test]
    fn idle_finalize_and_reconnect() {
        let (bridge, directory) = directory(true);
        directory.connect(CallerId(1), None).unwrap();
        directory.connect(CallerId(2), None).unwrap();

        directory.disconnect(CallerId(1));
        assert!(directory.is_connected());
        directory.disconnect(CallerId(2));
        assert!(!directory.is_connected());
        assert_eq!(finalizes(&bridge), 1);

        directory.connect(CallerId(3), None).unwrap();
        assert_eq!(inits(&bridge), 2);
    }

    #[test]
    fn shutdown_finalizes_once() {
        let (bridge, directory) = directory(false);
        let caller = directory.connect(CallerId(1), None).unwrap();
        directory.connect(CallerId(2), None).unwrap();

        assert_eq!(directory.shutdown(), 2);
        assert_eq!(directory.shutdown(), 0);
        assert!(caller.registry.is_destroyed());
        assert_eq!(finalizes(&bridge), 1);
    }

    #[test]
    fn no_caller_connects_after_shutdown() {
        let (bridge, directory) = directory(false);
        directory.connect(CallerId(1), None).unwrap();
        directory.shutdown();

        assert!(matches!(
            directory.connect(CallerId(2), None),
            Err(BridgeError::Context(_))
        ));
        assert!(!directory.is_connected());
        assert!(directory.is_empty());
        assert_eq!(inits(&bridge), 1);
    }

    #[test]
    fn connect_racing_shutdown_leaves_nothing_behind() {
        use std::sync::Barrier;
        use std::thread;

        for _ in 0..50 {
            let (bridge, directory) = directory(false);
            let directory = Arc::new(directory);
            directory.connect(CallerId(1), None).unwrap();
            let barrier = Arc::new(Barrier::new(2));

            let connecting = {
                let directory = Arc::clone(&directory);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    directory.connect(CallerId(2), None).is_ok()
                })
            };
            barrier.wait();
            let drained = directory.shutdown();
            let connected = connecting.join().unwrap();

            assert_eq!(drained, if connected { 2 } else { 1 });
            assert!(directory.is_empty());
            assert!(!directory.is_connected());
            assert_eq!(inits(&bridge), 1);
            assert_eq!(finalizes(&bridge), 1);
        }
    }
}
