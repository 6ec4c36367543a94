// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-process loopback engine.
//!
//! Implements the full [`NativeBridge`] contract without a TEE: contexts,
//! bridge-assigned ids, shared memory contents, a handful of built-in
//! commands and per-key cancellation. Every call is appended to a journal so
//! tests can assert exactly which engine calls the proxy made.
//!
//! ## Built-in commands
//!
//! | Id | Behaviour |
//! |----|-----------|
//! | [`COMMAND_ADD_VALUES`] | first value parameter: `a = a + b` |
//! | [`COMMAND_REVERSE_BUFFER`] | reverses every writable temporary buffer and registered window |
//! | [`COMMAND_FILL_REGISTERED`] | fills every writable registered window with [`FILL_BYTE`] |
//! | [`COMMAND_WAIT_FOR_CANCEL`] | blocks until the operation key is cancelled |
//!
//! Registered memrefs behave like mapped memory: contents sent with an input
//! or inout memref are written into the region before the command runs, and
//! the window of every output or inout memref is returned with the result.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use super::{
    BridgeError, InvokeCall, InvokeOutcome, NativeBridge, OpenSessionCall, SessionOutcome,
};
use crate::ids::{BridgeMemoryId, BridgeSessionId, ContextToken, MemoryId, OperationKey};
use crate::tee::{Direction, MemoryFlags, Operation, Parameter, ReturnCode, ReturnOrigin};

pub const COMMAND_ADD_VALUES: u32 = 0x1;
pub const COMMAND_REVERSE_BUFFER: u32 = 0x2;
pub const COMMAND_FILL_REGISTERED: u32 = 0x3;
pub const COMMAND_WAIT_FOR_CANCEL: u32 = 0x4;

/// Byte written by [`COMMAND_FILL_REGISTERED`].
pub const FILL_BYTE: u8 = 0xAB;

/// Upper bound on how long [`COMMAND_WAIT_FOR_CANCEL`] blocks.
const CANCEL_WAIT_LIMIT: Duration = Duration::from_secs(30);

/// Cancellations remembered for keys that have not started yet.
const EARLY_CANCEL_LIMIT: usize = 256;

/// One call received by the loopback engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCall {
    InitializeContext { tee_name: Option<String> },
    FinalizeContext(ContextToken),
    RegisterSharedMemory(BridgeMemoryId),
    ReleaseSharedMemory(BridgeMemoryId),
    OpenSession {
        session: Option<BridgeSessionId>,
        key: OperationKey,
    },
    CloseSession(BridgeSessionId),
    InvokeCommand {
        session: BridgeSessionId,
        command_id: u32,
        key: OperationKey,
    },
    RequestCancellation(OperationKey),
}

#[derive(Default)]
struct EngineState {
    next_handle: u32,
    next_token: u64,
    contexts: HashSet<ContextToken>,
    sessions: HashMap<BridgeSessionId, Uuid>,
    memory: HashMap<BridgeMemoryId, Vec<u8>>,
    in_flight: HashSet<OperationKey>,
    cancelled: HashSet<OperationKey>,
    early_cancels: VecDeque<OperationKey>,
}

impl EngineState {
    fn allocate_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Marks `key` as executing, picking up a cancellation that beat it here.
    fn start(&mut self, key: OperationKey) {
        self.in_flight.insert(key);
        if let Some(position) = self.early_cancels.iter().position(|early| *early == key) {
            self.early_cancels.remove(position);
            self.cancelled.insert(key);
        }
    }

    fn window(
        &mut self,
        memory_id: u32,
        offset: u32,
        size: u32,
    ) -> Result<&mut [u8], ReturnCode> {
        let region = self
            .memory
            .get_mut(&BridgeMemoryId(memory_id))
            .ok_or(ReturnCode::BAD_PARAMETERS)?;
        let start = offset as usize;
        let end = start.saturating_add(size as usize);
        region.get_mut(start..end).ok_or(ReturnCode::SHORT_BUFFER)
    }

    /// Writes caller-supplied contents of input and inout memrefs into their regions.
    fn sync_in(&mut self, operation: Option<&Operation>) -> Result<(), ReturnCode> {
        let Some(operation) = operation else {
            return Ok(());
        };
        for param in &operation.params {
            let Parameter::RegisteredMemref {
                memory_id,
                offset,
                size,
                direction,
                contents: Some(contents),
            } = param
            else {
                continue;
            };
            if *direction == Direction::Output {
                continue;
            }
            let window = self.window(*memory_id, *offset, *size)?;
            if window.len() != contents.len() {
                return Err(ReturnCode::BAD_PARAMETERS);
            }
            window.copy_from_slice(contents);
        }
        Ok(())
    }

    /// Fills in the window contents of output and inout memrefs.
    fn sync_out(&self, operation: &mut Operation) {
        for param in &mut operation.params {
            if let Parameter::RegisteredMemref {
                memory_id,
                offset,
                size,
                direction,
                contents,
            } = param
            {
                *contents = if writable(*direction) {
                    let start = *offset as usize;
                    self.memory
                        .get(&BridgeMemoryId(*memory_id))
                        .and_then(|region| region.get(start..start.saturating_add(*size as usize)))
                        .map(<[u8]>::to_vec)
                } else {
                    None
                };
            }
        }
    }
}

fn writable(direction: Direction) -> bool {
    direction != Direction::Input
}

/// In-process engine implementing [`NativeBridge`].
pub struct LoopbackBridge {
    tee_names: Option<Vec<String>>,
    trusted_apps: Option<HashSet<Uuid>>,
    state: Mutex<EngineState>,
    cancel_signal: Condvar,
    journal: Mutex<Vec<BridgeCall>>,
}

impl Default for LoopbackBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBridge {
    /// An engine that accepts any TEE name and any trusted application.
    pub fn new() -> Self {
        Self {
            tee_names: None,
            trusted_apps: None,
            state: Mutex::new(EngineState::default()),
            cancel_signal: Condvar::new(),
            journal: Mutex::new(Vec::new()),
        }
    }

    /// Only accept contexts for the named TEEs (the default TEE is always accepted).
    pub fn with_tee_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tee_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Only accept sessions to the given trusted applications.
    pub fn with_trusted_apps<I>(mut self, apps: I) -> Self
    where
        I: IntoIterator<Item = Uuid>,
    {
        self.trusted_apps = Some(apps.into_iter().collect());
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: BridgeCall) {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    /// Every call received so far, in arrival order.
    pub fn journal(&self) -> Vec<BridgeCall> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of journal entries matching `predicate`.
    pub fn count_calls<F>(&self, predicate: F) -> usize
    where
        F: Fn(&BridgeCall) -> bool,
    {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|call| predicate(call))
            .count()
    }

    pub fn has_context(&self) -> bool {
        !self.lock_state().contexts.is_empty()
    }

    pub fn open_session_count(&self) -> usize {
        self.lock_state().sessions.len()
    }

    pub fn registered_memory_count(&self) -> usize {
        self.lock_state().memory.len()
    }

    /// Current contents of a registered region.
    pub fn shared_memory(&self, bridge_id: BridgeMemoryId) -> Option<Vec<u8>> {
        self.lock_state().memory.get(&bridge_id).cloned()
    }

    /// True while an open/invoke call with this key is executing.
    pub fn is_in_flight(&self, key: OperationKey) -> bool {
        self.lock_state().in_flight.contains(&key)
    }

    fn finish(&self, key: OperationKey) {
        let mut state = self.lock_state();
        state.in_flight.remove(&key);
        state.cancelled.remove(&key);
    }

    fn check_memory_refs(state: &EngineState, operation: Option<&Operation>) -> bool {
        operation.is_none_or(|op| {
            op.is_well_formed()
                && op
                    .memory_refs()
                    .all(|id| state.memory.contains_key(&BridgeMemoryId(id)))
        })
    }

    fn wait_for_cancel(&self, key: OperationKey) -> InvokeOutcome {
        let deadline = Instant::now() + CANCEL_WAIT_LIMIT;
        let mut state = self.lock_state();
        loop {
            if state.cancelled.contains(&key) {
                return InvokeOutcome::failed(ReturnCode::CANCEL, ReturnOrigin::Tee);
            }
            let now = Instant::now();
            if now >= deadline {
                return InvokeOutcome::failed(ReturnCode::BUSY, ReturnOrigin::TrustedApp);
            }
            let (guard, _) = self
                .cancel_signal
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    fn run_command(&self, command_id: u32, operation: Option<&Operation>) -> InvokeOutcome {
        let mut operation = operation.cloned().unwrap_or_default();

        match command_id {
            COMMAND_ADD_VALUES => {
                let value = operation.params.iter_mut().find_map(|param| match param {
                    Parameter::Value { a, b, .. } => Some((a, b)),
                    _ => None,
                });
                let Some((a, b)) = value else {
                    return InvokeOutcome::failed(
                        ReturnCode::BAD_PARAMETERS,
                        ReturnOrigin::TrustedApp,
                    );
                };
                *a = a.wrapping_add(*b);
            }
            COMMAND_REVERSE_BUFFER => {
                let mut state = self.lock_state();
                for param in &mut operation.params {
                    match param {
                        Parameter::TempMemref { buffer, direction } if writable(*direction) => {
                            buffer.reverse();
                        }
                        Parameter::RegisteredMemref {
                            memory_id,
                            offset,
                            size,
                            direction,
                            ..
                        } if writable(*direction) => {
                            match state.window(*memory_id, *offset, *size) {
                                Ok(window) => window.reverse(),
                                Err(code) => return InvokeOutcome::failed(code, ReturnOrigin::Tee),
                            }
                        }
                        _ => {}
                    }
                }
            }
            COMMAND_FILL_REGISTERED => {
                let mut state = self.lock_state();
                for param in &operation.params {
                    let Parameter::RegisteredMemref {
                        memory_id,
                        offset,
                        size,
                        direction,
                        ..
                    } = param
                    else {
                        continue;
                    };
                    if !writable(*direction) {
                        continue;
                    }
                    match state.window(*memory_id, *offset, *size) {
                        Ok(window) => window.fill(FILL_BYTE),
                        Err(code) => return InvokeOutcome::failed(code, ReturnOrigin::Tee),
                    }
                }
            }
            _ => {
                return InvokeOutcome::failed(ReturnCode::NOT_IMPLEMENTED, ReturnOrigin::TrustedApp);
            }
        }

        InvokeOutcome {
            return_code: ReturnCode::SUCCESS,
            return_origin: ReturnOrigin::TrustedApp,
            operation: Some(operation),
        }
    }
}

impl NativeBridge for LoopbackBridge {
    fn initialize_context(
        &self,
        tee_name: Option<&str>,
        transport: &str,
    ) -> Result<ContextToken, BridgeError> {
        self.record(BridgeCall::InitializeContext {
            tee_name: tee_name.map(str::to_owned),
        });

        if transport.is_empty() {
            return Err(BridgeError::Context("engine transport is not configured".into()));
        }
        if let (Some(name), Some(known)) = (tee_name, &self.tee_names) {
            if !known.iter().any(|candidate| candidate == name) {
                return Err(BridgeError::Context(format!("no TEE named {name}")));
            }
        }

        let mut state = self.lock_state();
        state.next_token += 1;
        let token = ContextToken(state.next_token);
        state.contexts.insert(token);
        debug!(token = %token, "loopback: context initialized");
        Ok(token)
    }

    fn finalize_context(&self, token: ContextToken) {
        self.record(BridgeCall::FinalizeContext(token));
        self.lock_state().contexts.remove(&token);
    }

    fn register_shared_memory(
        &self,
        buffer: &[u8],
        flags: MemoryFlags,
        memory_id: MemoryId,
    ) -> Result<BridgeMemoryId, BridgeError> {
        let mut state = self.lock_state();
        if state.contexts.is_empty() {
            return Err(BridgeError::SharedMemory("no initialized context".into()));
        }
        if !flags.is_valid() {
            return Err(BridgeError::SharedMemory(format!(
                "invalid flags {:#x} for memory {memory_id}",
                flags.0
            )));
        }
        let bridge_id = BridgeMemoryId(state.allocate_handle());
        state.memory.insert(bridge_id, buffer.to_vec());
        drop(state);

        self.record(BridgeCall::RegisterSharedMemory(bridge_id));
        Ok(bridge_id)
    }

    fn release_shared_memory(&self, bridge_id: BridgeMemoryId) -> Result<(), BridgeError> {
        self.record(BridgeCall::ReleaseSharedMemory(bridge_id));
        match self.lock_state().memory.remove(&bridge_id) {
            Some(_) => Ok(()),
            None => Err(BridgeError::UnknownHandle(format!("shared memory {bridge_id}"))),
        }
    }

    fn open_session(&self, call: OpenSessionCall<'_>) -> SessionOutcome {
        let outcome = {
            let mut state = self.lock_state();
            if state.contexts.is_empty() {
                SessionOutcome::failed(ReturnCode::BAD_STATE, ReturnOrigin::Comms)
            } else if self
                .trusted_apps
                .as_ref()
                .is_some_and(|apps| !apps.contains(&call.trusted_app))
            {
                SessionOutcome::failed(ReturnCode::ITEM_NOT_FOUND, ReturnOrigin::Tee)
            } else if !Self::check_memory_refs(&state, call.operation) {
                SessionOutcome::failed(ReturnCode::BAD_PARAMETERS, ReturnOrigin::Tee)
            } else if let Err(code) = state.sync_in(call.operation) {
                SessionOutcome::failed(code, ReturnOrigin::Tee)
            } else {
                let bridge_id = BridgeSessionId(state.allocate_handle());
                state.sessions.insert(bridge_id, call.trusted_app);
                let mut operation = call.operation.cloned();
                if let Some(operation) = operation.as_mut() {
                    state.sync_out(operation);
                }
                SessionOutcome {
                    bridge_id: Some(bridge_id),
                    return_code: ReturnCode::SUCCESS,
                    return_origin: ReturnOrigin::TrustedApp,
                    operation,
                }
            }
        };

        self.record(BridgeCall::OpenSession {
            session: outcome.bridge_id,
            key: call.key,
        });
        outcome
    }

    fn close_session(&self, bridge_id: BridgeSessionId) -> Result<(), BridgeError> {
        self.record(BridgeCall::CloseSession(bridge_id));
        match self.lock_state().sessions.remove(&bridge_id) {
            Some(_) => Ok(()),
            None => Err(BridgeError::UnknownHandle(format!("session {bridge_id}"))),
        }
    }

    fn invoke_command(&self, call: InvokeCall<'_>) -> InvokeOutcome {
        self.record(BridgeCall::InvokeCommand {
            session: call.session,
            command_id: call.command_id,
            key: call.key,
        });

        {
            let mut state = self.lock_state();
            if !state.sessions.contains_key(&call.session) {
                return InvokeOutcome::failed(ReturnCode::ITEM_NOT_FOUND, ReturnOrigin::Tee);
            }
            if !Self::check_memory_refs(&state, call.operation) {
                return InvokeOutcome::failed(ReturnCode::BAD_PARAMETERS, ReturnOrigin::Tee);
            }
            if let Err(code) = state.sync_in(call.operation) {
                return InvokeOutcome::failed(code, ReturnOrigin::Tee);
            }
            state.start(call.key);
        }

        let mut outcome = if call.command_id == COMMAND_WAIT_FOR_CANCEL {
            self.wait_for_cancel(call.key)
        } else {
            self.run_command(call.command_id, call.operation)
        };
        if let Some(operation) = outcome.operation.as_mut() {
            self.lock_state().sync_out(operation);
        }

        self.finish(call.key);
        outcome
    }

    fn request_cancellation(&self, key: OperationKey) {
        self.record(BridgeCall::RequestCancellation(key));
        let mut state = self.lock_state();
        if state.in_flight.contains(&key) {
            state.cancelled.insert(key);
            self.cancel_signal.notify_all();
        } else if !state.early_cancels.contains(&key) {
            debug!(key = %key, "loopback: remembering cancellation for operation not yet started");
            if state.early_cancels.len() == EARLY_CANCEL_LIMIT {
                state.early_cancels.pop_front();
            }
            state.early_cancels.push_back(key);
        }
    }
}
