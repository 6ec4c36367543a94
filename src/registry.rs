// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Caller Registry
//!
//! Per-caller bookkeeping of every session and shared memory region the
//! caller holds, in both numbering spaces.
//!
//! ## Structure
//!
//! | Map | Left (caller-facing) | Right (bridge-assigned) |
//! |-----|----------------------|-------------------------|
//! | sessions | [`SessionId`] | [`BridgeSessionId`] |
//! | shared memory | [`MemoryId`] | [`BridgeMemoryId`] |
//!
//! Regions can additionally be found by their own handle
//! ([`SharedMemoryRegion::handle`]).
//!
//! Each recorded pair owns a [`ResourceNode`] attached under the registry's
//! root node. Removing a pair destroys its node, which closes the session or
//! releases the region on the bridge. Destroying the registry cascades over
//! every node still attached, so each bridge resource is released exactly
//! once whichever path gets there first.
//!
//! All map mutations happen under one mutex. Bridge calls never run while it
//! is held.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::bimap::{BiMap, Side};
use crate::bridge::NativeBridge;
use crate::ids::{BridgeMemoryId, BridgeSessionId, CallerId, MemoryId, SessionId};
use crate::ownership::{OwnershipError, ResourceNode};
use crate::tee::{MemoryFlags, Operation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Session,
    SharedMemory,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session => f.write_str("session"),
            Self::SharedMemory => f.write_str("shared memory"),
        }
    }
}

/// Numbering space an id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSpace {
    CallerFacing,
    Bridge,
}

impl fmt::Display for IdSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallerFacing => f.write_str("caller-facing"),
            Self::Bridge => f.write_str("bridge"),
        }
    }
}

impl From<Side> for IdSpace {
    fn from(side: Side) -> Self {
        match side {
            Side::Left => Self::CallerFacing,
            Side::Right => Self::Bridge,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate {kind} id {id} ({space})")]
    DuplicateId {
        kind: ResourceKind,
        space: IdSpace,
        id: u32,
    },

    #[error("{kind} id {id} not found ({space})")]
    NotFound {
        kind: ResourceKind,
        space: IdSpace,
        id: u32,
    },

    #[error("registry of caller {0} is already destroyed")]
    AlreadyDestroyed(CallerId),

    #[error(transparent)]
    Ownership(OwnershipError),
}

/// A buffer registered with the engine on behalf of a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedMemoryRegion {
    pub handle: Uuid,
    pub id: MemoryId,
    pub flags: MemoryFlags,
    pub size: usize,
}

impl SharedMemoryRegion {
    pub fn new(id: MemoryId, flags: MemoryFlags, size: usize) -> Self {
        Self {
            handle: Uuid::new_v4(),
            id,
            flags,
            size,
        }
    }
}

/// Counts of resources released by a registry teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub sessions: usize,
    pub regions: usize,
}

struct RegionEntry {
    region: Arc<SharedMemoryRegion>,
    node: Arc<ResourceNode>,
}

#[derive(Default)]
struct RegistryState {
    destroyed: bool,
    sessions: BiMap<SessionId, BridgeSessionId>,
    session_nodes: HashMap<BridgeSessionId, Arc<ResourceNode>>,
    memory: BiMap<MemoryId, BridgeMemoryId>,
    regions: HashMap<BridgeMemoryId, RegionEntry>,
    region_handles: HashMap<Uuid, BridgeMemoryId>,
}

impl RegistryState {
    fn clear(&mut self) {
        self.sessions.clear();
        self.session_nodes.clear();
        self.memory.clear();
        self.regions.clear();
        self.region_handles.clear();
    }

    fn take_region(&mut self, bridge_id: BridgeMemoryId) -> Option<RegionEntry> {
        let entry = self.regions.remove(&bridge_id)?;
        self.region_handles.remove(&entry.region.handle);
        Some(entry)
    }
}

pub struct CallerRegistry {
    caller: CallerId,
    bridge: Arc<dyn NativeBridge>,
    root: Arc<ResourceNode>,
    state: Arc<Mutex<RegistryState>>,
}

impl fmt::Debug for CallerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallerRegistry")
            .field("caller", &self.caller)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

fn lock_state(state: &Mutex<RegistryState>) -> MutexGuard<'_, RegistryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CallerRegistry {
    pub fn new(caller: CallerId, bridge: Arc<dyn NativeBridge>) -> Self {
        let state = Arc::new(Mutex::new(RegistryState::default()));
        let root = {
            let state = Arc::clone(&state);
            ResourceNode::new("registry", move || {
                let mut state = lock_state(&state);
                state.destroyed = true;
                state.clear();
                debug!(caller_id = %caller, "registry drained");
            })
        };
        Self {
            caller,
            bridge,
            root,
            state,
        }
    }

    pub fn caller(&self) -> CallerId {
        self.caller
    }

    /// Root of this caller's ownership subtree.
    pub fn node(&self) -> &Arc<ResourceNode> {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        lock_state(&self.state)
    }

    fn live_state(&self) -> Result<MutexGuard<'_, RegistryState>, RegistryError> {
        let state = self.lock();
        if state.destroyed {
            return Err(RegistryError::AlreadyDestroyed(self.caller));
        }
        Ok(state)
    }

    fn attach_error(&self, error: OwnershipError) -> RegistryError {
        match error {
            OwnershipError::ParentDestroyed { .. } => RegistryError::AlreadyDestroyed(self.caller),
            other => RegistryError::Ownership(other),
        }
    }

    // Session map

    /// Record a session pair.
    ///
    /// The bridge session is closed when the pair is removed or the registry
    /// is destroyed. On error nothing is recorded and the bridge session is
    /// left to the caller.
    pub fn add_session(
        &self,
        id: SessionId,
        bridge_id: BridgeSessionId,
    ) -> Result<(), RegistryError> {
        let mut state = self.live_state()?;
        state
            .sessions
            .insert(id, bridge_id)
            .map_err(|side| RegistryError::DuplicateId {
                kind: ResourceKind::Session,
                space: side.into(),
                id: match side {
                    Side::Left => id.0,
                    Side::Right => bridge_id.0,
                },
            })?;

        let node = {
            let bridge = Arc::clone(&self.bridge);
            let caller = self.caller;
            ResourceNode::new("session", move || {
                if let Err(e) = bridge.close_session(bridge_id) {
                    warn!(caller_id = %caller, bridge_id = %bridge_id, error = %e, "close session failed");
                }
            })
        };
        if let Err(e) = node.attach(&self.root) {
            state.sessions.remove_by_left(&id);
            return Err(self.attach_error(e));
        }
        state.session_nodes.insert(bridge_id, node);

        debug!(caller_id = %self.caller, session_id = %id, bridge_id = %bridge_id, "session recorded");
        Ok(())
    }

    fn close_session_node(&self, node: Option<Arc<ResourceNode>>) {
        if let Some(node) = node {
            node.destroy();
        }
    }

    /// Remove a session by its caller-facing id, closing it on the bridge.
    pub fn remove_session_by_caller_id(
        &self,
        id: SessionId,
    ) -> Result<BridgeSessionId, RegistryError> {
        let (bridge_id, node) = {
            let mut state = self.live_state()?;
            let bridge_id =
                state
                    .sessions
                    .remove_by_left(&id)
                    .ok_or(RegistryError::NotFound {
                        kind: ResourceKind::Session,
                        space: IdSpace::CallerFacing,
                        id: id.0,
                    })?;
            (bridge_id, state.session_nodes.remove(&bridge_id))
        };
        self.close_session_node(node);
        Ok(bridge_id)
    }

    /// Remove a session by its bridge id, closing it on the bridge.
    pub fn remove_session_by_bridge_id(
        &self,
        bridge_id: BridgeSessionId,
    ) -> Result<SessionId, RegistryError> {
        let (id, node) = {
            let mut state = self.live_state()?;
            let id = state
                .sessions
                .remove_by_right(&bridge_id)
                .ok_or(RegistryError::NotFound {
                    kind: ResourceKind::Session,
                    space: IdSpace::Bridge,
                    id: bridge_id.0,
                })?;
            (id, state.session_nodes.remove(&bridge_id))
        };
        self.close_session_node(node);
        Ok(id)
    }

    pub fn bridge_session_id(&self, id: SessionId) -> Option<BridgeSessionId> {
        self.lock().sessions.get_by_left(&id).copied()
    }

    pub fn session_id(&self, bridge_id: BridgeSessionId) -> Option<SessionId> {
        self.lock().sessions.get_by_right(&bridge_id).copied()
    }

    pub fn contains_session(&self, id: SessionId) -> bool {
        self.lock().sessions.contains_left(&id)
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    // Shared memory map

    /// Record a region registered on the bridge under `bridge_id`.
    pub fn add_shared_memory(
        &self,
        bridge_id: BridgeMemoryId,
        region: SharedMemoryRegion,
    ) -> Result<Arc<SharedMemoryRegion>, RegistryError> {
        let mut state = self.live_state()?;
        let id = region.id;
        state
            .memory
            .insert(id, bridge_id)
            .map_err(|side| RegistryError::DuplicateId {
                kind: ResourceKind::SharedMemory,
                space: side.into(),
                id: match side {
                    Side::Left => id.0,
                    Side::Right => bridge_id.0,
                },
            })?;

        let node = {
            let bridge = Arc::clone(&self.bridge);
            let caller = self.caller;
            ResourceNode::new("shared_memory", move || {
                if let Err(e) = bridge.release_shared_memory(bridge_id) {
                    warn!(caller_id = %caller, bridge_id = %bridge_id, error = %e, "release shared memory failed");
                }
            })
        };
        if let Err(e) = node.attach(&self.root) {
            state.memory.remove_by_left(&id);
            return Err(self.attach_error(e));
        }

        let region = Arc::new(region);
        state.region_handles.insert(region.handle, bridge_id);
        state.regions.insert(
            bridge_id,
            RegionEntry {
                region: Arc::clone(&region),
                node,
            },
        );

        debug!(caller_id = %self.caller, memory_id = %id, bridge_id = %bridge_id, size = region.size, "shared memory recorded");
        Ok(region)
    }

    fn release_region(&self, entry: Option<RegionEntry>) {
        if let Some(entry) = entry {
            entry.node.destroy();
        }
    }

    /// Remove a region by its bridge id, releasing it on the bridge.
    pub fn remove_shared_memory_by_bridge_id(
        &self,
        bridge_id: BridgeMemoryId,
    ) -> Result<MemoryId, RegistryError> {
        let (id, entry) = {
            let mut state = self.live_state()?;
            let id = state
                .memory
                .remove_by_right(&bridge_id)
                .ok_or(RegistryError::NotFound {
                    kind: ResourceKind::SharedMemory,
                    space: IdSpace::Bridge,
                    id: bridge_id.0,
                })?;
            (id, state.take_region(bridge_id))
        };
        self.release_region(entry);
        Ok(id)
    }

    /// Remove a region by its caller-facing id, releasing it on the bridge.
    pub fn remove_shared_memory_by_caller_id(
        &self,
        id: MemoryId,
    ) -> Result<BridgeMemoryId, RegistryError> {
        let (bridge_id, entry) = {
            let mut state = self.live_state()?;
            let bridge_id =
                state
                    .memory
                    .remove_by_left(&id)
                    .ok_or(RegistryError::NotFound {
                        kind: ResourceKind::SharedMemory,
                        space: IdSpace::CallerFacing,
                        id: id.0,
                    })?;
            (bridge_id, state.take_region(bridge_id))
        };
        self.release_region(entry);
        Ok(bridge_id)
    }

    pub fn bridge_memory_id(&self, id: MemoryId) -> Option<BridgeMemoryId> {
        self.lock().memory.get_by_left(&id).copied()
    }

    pub fn memory_id(&self, bridge_id: BridgeMemoryId) -> Option<MemoryId> {
        self.lock().memory.get_by_right(&bridge_id).copied()
    }

    /// Bridge id of a region, looked up by the region's own handle.
    pub fn bridge_memory_id_for_region(&self, handle: Uuid) -> Option<BridgeMemoryId> {
        self.lock().region_handles.get(&handle).copied()
    }

    pub fn region(&self, bridge_id: BridgeMemoryId) -> Option<Arc<SharedMemoryRegion>> {
        self.lock()
            .regions
            .get(&bridge_id)
            .map(|entry| Arc::clone(&entry.region))
    }

    pub fn contains_shared_memory(&self, id: MemoryId) -> bool {
        self.lock().memory.contains_left(&id)
    }

    pub fn shared_memory_count(&self) -> usize {
        self.lock().memory.len()
    }

    // Operation translation

    /// Rewrite registered memory references to bridge ids.
    ///
    /// Returns the first caller-facing id this caller never registered.
    pub fn operation_to_bridge(&self, operation: &Operation) -> Result<Operation, MemoryId> {
        let state = self.lock();
        operation
            .rewrite_memory_refs(|id| state.memory.get_by_left(&MemoryId(id)).map(|b| b.0))
            .map_err(MemoryId)
    }

    /// Rewrite registered memory references back to caller-facing ids.
    ///
    /// References the registry no longer knows are left as they are.
    pub fn operation_to_caller(&self, operation: &Operation) -> Operation {
        let state = self.lock();
        let rewritten = operation.rewrite_memory_refs(|id| {
            Some(match state.memory.get_by_right(&BridgeMemoryId(id)) {
                Some(caller_id) => caller_id.0,
                None => {
                    warn!(caller_id = %self.caller, bridge_id = id, "returned memory reference is not registered");
                    id
                }
            })
        });
        rewritten.unwrap_or_else(|_| operation.clone())
    }

    // Teardown

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    /// Close every session and release every region still recorded.
    ///
    /// A second call reports nothing and makes no bridge calls.
    pub fn destroy(&self) -> TeardownReport {
        let report = {
            let mut state = self.lock();
            if state.destroyed {
                return TeardownReport::default();
            }
            state.destroyed = true;
            TeardownReport {
                sessions: state.sessions.len(),
                regions: state.memory.len(),
            }
        };
        self.root.destroy();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeCall, LoopbackBridge};
    use std::thread;

    fn registry() -> (Arc<LoopbackBridge>, CallerRegistry) {
        let bridge = Arc::new(LoopbackBridge::new());
        let registry = CallerRegistry::new(CallerId(4242), bridge.clone());
        (bridge, registry)
    }

    fn closes(bridge: &LoopbackBridge, id: u32) -> usize {
        bridge.count_calls(|call| *call == BridgeCall::CloseSession(BridgeSessionId(id)))
    }

    fn releases(bridge: &LoopbackBridge, id: u32) -> usize {
        bridge.count_calls(|call| *call == BridgeCall::ReleaseSharedMemory(BridgeMemoryId(id)))
    }

    #[test]
    fn destroy_closes_live_sessions_then_rejects_removal() {
        let (bridge, registry) = registry();
        registry.add_session(SessionId(7), BridgeSessionId(101)).unwrap();
        registry.add_session(SessionId(8), BridgeSessionId(102)).unwrap();

        let report = registry.destroy();

        assert_eq!(report, TeardownReport { sessions: 2, regions: 0 });
        assert_eq!(closes(&bridge, 101), 1);
        assert_eq!(closes(&bridge, 102), 1);
        assert_eq!(
            registry.remove_session_by_caller_id(SessionId(7)),
            Err(RegistryError::AlreadyDestroyed(CallerId(4242)))
        );
        assert_eq!(
            registry.add_session(SessionId(9), BridgeSessionId(103)),
            Err(RegistryError::AlreadyDestroyed(CallerId(4242)))
        );
    }

    #[test]
    fn duplicate_bridge_memory_id_keeps_first_region() {
        let (_bridge, registry) = registry();
        let region_a = SharedMemoryRegion::new(MemoryId(1), MemoryFlags::INOUT, 64);
        let region_b = SharedMemoryRegion::new(MemoryId(2), MemoryFlags::INPUT, 32);
        let handle_a = region_a.handle;

        registry.add_shared_memory(BridgeMemoryId(201), region_a).unwrap();
        let err = registry
            .add_shared_memory(BridgeMemoryId(201), region_b)
            .unwrap_err();

        assert_eq!(
            err,
            RegistryError::DuplicateId {
                kind: ResourceKind::SharedMemory,
                space: IdSpace::Bridge,
                id: 201
            }
        );
        assert_eq!(registry.memory_id(BridgeMemoryId(201)), Some(MemoryId(1)));
        assert_eq!(registry.region(BridgeMemoryId(201)).unwrap().handle, handle_a);
        assert!(!registry.contains_shared_memory(MemoryId(2)));
        assert_eq!(
            registry.bridge_memory_id_for_region(handle_a),
            Some(BridgeMemoryId(201))
        );
    }

    #[test]
    fn removing_unknown_ids_is_not_found() {
        let (bridge, registry) = registry();
        assert!(matches!(
            registry.remove_session_by_bridge_id(BridgeSessionId(555)),
            Err(RegistryError::NotFound { .. })
        ));
        assert!(matches!(
            registry.remove_shared_memory_by_caller_id(MemoryId(3)),
            Err(RegistryError::NotFound { .. })
        ));
        assert!(bridge.journal().is_empty());
    }

    #[test]
    fn removal_releases_once_and_destroy_skips_it() {
        let (bridge, registry) = registry();
        registry.add_session(SessionId(1), BridgeSessionId(11)).unwrap();
        registry.add_session(SessionId(2), BridgeSessionId(12)).unwrap();
        registry
            .add_shared_memory(
                BridgeMemoryId(21),
                SharedMemoryRegion::new(MemoryId(1), MemoryFlags::INPUT, 8),
            )
            .unwrap();
        registry
            .add_shared_memory(
                BridgeMemoryId(22),
                SharedMemoryRegion::new(MemoryId(2), MemoryFlags::INPUT, 8),
            )
            .unwrap();

        assert_eq!(
            registry.remove_session_by_bridge_id(BridgeSessionId(11)),
            Ok(SessionId(1))
        );
        assert_eq!(
            registry.remove_shared_memory_by_caller_id(MemoryId(2)),
            Ok(BridgeMemoryId(22))
        );

        let report = registry.destroy();
        assert_eq!(report, TeardownReport { sessions: 1, regions: 1 });
        assert_eq!(registry.destroy(), TeardownReport::default());

        for id in [11, 12] {
            assert_eq!(closes(&bridge, id), 1);
        }
        for id in [21, 22] {
            assert_eq!(releases(&bridge, id), 1);
        }
    }

    #[test]
    fn duplicate_caller_facing_session_is_rejected() {
        let (_bridge, registry) = registry();
        registry.add_session(SessionId(1), BridgeSessionId(11)).unwrap();
        assert!(matches!(
            registry.add_session(SessionId(1), BridgeSessionId(12)),
            Err(RegistryError::DuplicateId {
                space: IdSpace::CallerFacing,
                ..
            })
        ));
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn session_lookups_stay_inverse() {
        let (_bridge, registry) = registry();
        let mut seed: u32 = 0x9E37_79B9;
        for _ in 0..2_000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let id = SessionId(seed % 12);
            let bridge_id = BridgeSessionId((seed >> 8) % 12 + 100);
            match seed % 3 {
                0 => {
                    let _ = registry.add_session(id, bridge_id);
                }
                1 => {
                    let _ = registry.remove_session_by_caller_id(id);
                }
                _ => {
                    let _ = registry.remove_session_by_bridge_id(bridge_id);
                }
            }
            for candidate in 0..12 {
                if let Some(b) = registry.bridge_session_id(SessionId(candidate)) {
                    assert_eq!(registry.session_id(b), Some(SessionId(candidate)));
                }
            }
        }
    }

    #[test]
    fn memory_removal_by_bridge_id_releases_once() {
        let (bridge, registry) = registry();
        let region = SharedMemoryRegion::new(MemoryId(5), MemoryFlags::INOUT, 32);
        let handle = region.handle;
        registry.add_shared_memory(BridgeMemoryId(305), region).unwrap();
        registry
            .add_shared_memory(
                BridgeMemoryId(306),
                SharedMemoryRegion::new(MemoryId(6), MemoryFlags::INPUT, 8),
            )
            .unwrap();

        assert_eq!(
            registry.remove_shared_memory_by_bridge_id(BridgeMemoryId(305)),
            Ok(MemoryId(5))
        );
        assert_eq!(releases(&bridge, 305), 1);
        assert_eq!(registry.memory_id(BridgeMemoryId(305)), None);
        assert_eq!(registry.bridge_memory_id(MemoryId(5)), None);
        assert_eq!(registry.bridge_memory_id_for_region(handle), None);
        assert!(registry.region(BridgeMemoryId(305)).is_none());
        assert_eq!(registry.shared_memory_count(), 1);

        assert_eq!(
            registry.remove_shared_memory_by_bridge_id(BridgeMemoryId(305)),
            Err(RegistryError::NotFound {
                kind: ResourceKind::SharedMemory,
                space: IdSpace::Bridge,
                id: 305
            })
        );
        assert_eq!(releases(&bridge, 305), 1);

        assert_eq!(registry.destroy(), TeardownReport { sessions: 0, regions: 1 });
        assert_eq!(
            registry.remove_shared_memory_by_bridge_id(BridgeMemoryId(306)),
            Err(RegistryError::AlreadyDestroyed(CallerId(4242)))
        );
        assert_eq!(releases(&bridge, 306), 1);
    }

    #[test]
    fn memory_lookups_stay_inverse() {
        let (_bridge, registry) = registry();
        let mut handles = std::collections::HashMap::new();
        let mut seed: u32 = 0x2545_F491;
        for _ in 0..2_000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let id = MemoryId(seed % 12);
            let bridge_id = BridgeMemoryId((seed >> 8) % 12 + 300);
            match seed % 3 {
                0 => {
                    let region = SharedMemoryRegion::new(id, MemoryFlags::INOUT, 4);
                    let handle = region.handle;
                    if registry.add_shared_memory(bridge_id, region).is_ok() {
                        handles.insert(id, handle);
                    }
                }
                1 => {
                    let _ = registry.remove_shared_memory_by_caller_id(id);
                }
                _ => {
                    let _ = registry.remove_shared_memory_by_bridge_id(bridge_id);
                }
            }
            for candidate in (0..12).map(MemoryId) {
                match registry.bridge_memory_id(candidate) {
                    Some(b) => {
                        assert_eq!(registry.memory_id(b), Some(candidate));
                        assert_eq!(registry.region(b).unwrap().id, candidate);
                        assert_eq!(registry.bridge_memory_id_for_region(handles[&candidate]), Some(b));
                    }
                    None => {
                        if let Some(handle) = handles.get(&candidate) {
                            assert_eq!(registry.bridge_memory_id_for_region(*handle), None);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn memory_refs_translate_both_ways() {
        use crate::tee::{Direction, Parameter};

        let (_bridge, registry) = registry();
        registry
            .add_shared_memory(
                BridgeMemoryId(900),
                SharedMemoryRegion::new(MemoryId(3), MemoryFlags::INOUT, 16),
            )
            .unwrap();

        let op = Operation::new(vec![Parameter::RegisteredMemref {
            memory_id: 3,
            offset: 0,
            size: 16,
            direction: Direction::Inout,
            contents: None,
        }]);
        let bridged = registry.operation_to_bridge(&op).unwrap();
        assert_eq!(bridged.memory_refs().collect::<Vec<_>>(), vec![900]);
        assert_eq!(registry.operation_to_caller(&bridged), op);

        let unknown = Operation::new(vec![Parameter::RegisteredMemref {
            memory_id: 4,
            offset: 0,
            size: 1,
            direction: Direction::Input,
            contents: None,
        }]);
        assert_eq!(registry.operation_to_bridge(&unknown), Err(MemoryId(4)));
    }

    #[test]
    fn concurrent_destroy_and_removal_close_each_session_once() {
        for _ in 0..20 {
            let bridge = Arc::new(LoopbackBridge::new());
            let registry = Arc::new(CallerRegistry::new(CallerId(1), bridge.clone()));
            for i in 0..16 {
                registry
                    .add_session(SessionId(i), BridgeSessionId(1000 + i))
                    .unwrap();
            }

            let mut handles = Vec::new();
            for i in (0..16).step_by(2) {
                let registry = Arc::clone(&registry);
                handles.push(thread::spawn(move || {
                    let _ = registry.remove_session_by_caller_id(SessionId(i));
                }));
            }
            for _ in 0..3 {
                let registry = Arc::clone(&registry);
                handles.push(thread::spawn(move || {
                    registry.destroy();
                }));
            }
            for handle in handles {
                handle.join().unwrap();
            }

            for i in 0..16 {
                assert_eq!(closes(&bridge, 1000 + i), 1);
            }
        }
    }
}
