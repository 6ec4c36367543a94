// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Unix socket bridge.
//!
//! Each bridge call opens its own connection to the engine, writes one
//! newline-terminated JSON [`BridgeFrame`] and reads one [`BridgeReply`]. A
//! blocked `invoke_command` therefore never stalls a concurrent
//! `request_cancellation` for the same key.
//!
//! [`serve`] is the engine side of the same framing. It puts any
//! [`NativeBridge`] behind a listener, which is how the integration tests
//! drive [`SocketBridge`] end to end.

use std::io::{BufRead, BufReader, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    BridgeError, InvokeCall, InvokeOutcome, NativeBridge, OpenSessionCall, SessionOutcome,
};
use crate::ids::{BridgeMemoryId, BridgeSessionId, ContextToken, MemoryId, OperationKey, SessionId};
use crate::tee::{base64_bytes, ConnectionMethod, MemoryFlags, Operation, ReturnCode, ReturnOrigin};

/// Request frame sent to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum BridgeFrame {
    InitializeContext {
        tee_name: Option<String>,
    },
    FinalizeContext {
        token: ContextToken,
    },
    RegisterSharedMemory {
        #[serde(with = "base64_bytes")]
        buffer: Vec<u8>,
        flags: MemoryFlags,
        memory_id: MemoryId,
    },
    ReleaseSharedMemory {
        bridge_id: BridgeMemoryId,
    },
    OpenSession {
        session_id: SessionId,
        trusted_app: Uuid,
        connection_method: ConnectionMethod,
        connection_data: u32,
        operation: Option<Operation>,
        key: OperationKey,
    },
    CloseSession {
        bridge_id: BridgeSessionId,
    },
    InvokeCommand {
        session: BridgeSessionId,
        command_id: u32,
        operation: Option<Operation>,
        key: OperationKey,
    },
    RequestCancellation {
        key: OperationKey,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Context,
    SharedMemory,
    UnknownHandle,
    Protocol,
}

/// Reply frame sent back by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BridgeReply {
    Context { token: ContextToken },
    SharedMemory { bridge_id: BridgeMemoryId },
    Session(SessionOutcome),
    Invoke(InvokeOutcome),
    Done,
    Failed { kind: FailureKind, message: String },
}

impl BridgeReply {
    fn failure(error: BridgeError) -> Self {
        let kind = match &error {
            BridgeError::Context(_) => FailureKind::Context,
            BridgeError::SharedMemory(_) => FailureKind::SharedMemory,
            BridgeError::UnknownHandle(_) => FailureKind::UnknownHandle,
            BridgeError::Transport(_) | BridgeError::Protocol(_) => FailureKind::Protocol,
        };
        Self::Failed {
            kind,
            message: error.to_string(),
        }
    }

    fn into_error(self) -> BridgeError {
        match self {
            Self::Failed { kind, message } => match kind {
                FailureKind::Context => BridgeError::Context(message),
                FailureKind::SharedMemory => BridgeError::SharedMemory(message),
                FailureKind::UnknownHandle => BridgeError::UnknownHandle(message),
                FailureKind::Protocol => BridgeError::Protocol(message),
            },
            other => BridgeError::Protocol(format!("unexpected reply: {other:?}")),
        }
    }
}

fn write_frame<T: Serialize>(stream: &UnixStream, frame: &T) -> Result<(), BridgeError> {
    let mut payload =
        serde_json::to_vec(frame).map_err(|e| BridgeError::Protocol(e.to_string()))?;
    payload.push(b'\n');
    let mut writer = stream;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

fn read_frame<T: for<'de> Deserialize<'de>>(stream: &UnixStream) -> Result<Option<T>, BridgeError> {
    let mut line = String::new();
    if BufReader::new(stream).read_line(&mut line)? == 0 {
        return Ok(None);
    }
    serde_json::from_str(&line)
        .map(Some)
        .map_err(|e| BridgeError::Protocol(e.to_string()))
}

/// [`NativeBridge`] speaking to an engine over a Unix socket.
#[derive(Debug, Default)]
pub struct SocketBridge {
    transport: Mutex<Option<PathBuf>>,
}

impl SocketBridge {
    pub fn new() -> Self {
        Self::default()
    }

    fn transport(&self) -> Option<PathBuf> {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn exchange(path: &Path, frame: &BridgeFrame) -> Result<BridgeReply, BridgeError> {
        let stream = UnixStream::connect(path)?;
        write_frame(&stream, frame)?;
        stream.shutdown(Shutdown::Write)?;
        read_frame(&stream)?
            .ok_or_else(|| BridgeError::Protocol("engine closed the connection".into()))
    }

    fn call(&self, frame: &BridgeFrame) -> Result<BridgeReply, BridgeError> {
        let path = self
            .transport()
            .ok_or_else(|| BridgeError::Context("no initialized context".into()))?;
        Self::exchange(&path, frame)
    }

    fn expect_done(&self, frame: &BridgeFrame) -> Result<(), BridgeError> {
        match self.call(frame)? {
            BridgeReply::Done => Ok(()),
            other => Err(other.into_error()),
        }
    }
}

impl NativeBridge for SocketBridge {
    fn initialize_context(
        &self,
        tee_name: Option<&str>,
        transport: &str,
    ) -> Result<ContextToken, BridgeError> {
        let path = PathBuf::from(transport);
        let frame = BridgeFrame::InitializeContext {
            tee_name: tee_name.map(str::to_owned),
        };
        let reply = Self::exchange(&path, &frame).map_err(|e| match e {
            BridgeError::Transport(io) => {
                BridgeError::Context(format!("cannot reach engine at {transport}: {io}"))
            }
            other => other,
        })?;

        match reply {
            BridgeReply::Context { token } => {
                *self.transport.lock().unwrap_or_else(PoisonError::into_inner) = Some(path);
                debug!(transport, token = %token, "socket bridge: context initialized");
                Ok(token)
            }
            other => Err(other.into_error()),
        }
    }

    fn finalize_context(&self, token: ContextToken) {
        if let Err(e) = self.expect_done(&BridgeFrame::FinalizeContext { token }) {
            warn!(token = %token, error = %e, "socket bridge: finalize context failed");
        }
        *self.transport.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn register_shared_memory(
        &self,
        buffer: &[u8],
        flags: MemoryFlags,
        memory_id: MemoryId,
    ) -> Result<BridgeMemoryId, BridgeError> {
        let frame = BridgeFrame::RegisterSharedMemory {
            buffer: buffer.to_vec(),
            flags,
            memory_id,
        };
        let reply = self.call(&frame).map_err(|e| match e {
            BridgeError::Context(message) => BridgeError::SharedMemory(message),
            BridgeError::Transport(io) => BridgeError::SharedMemory(io.to_string()),
            other => other,
        })?;
        match reply {
            BridgeReply::SharedMemory { bridge_id } => Ok(bridge_id),
            other => Err(other.into_error()),
        }
    }

    fn release_shared_memory(&self, bridge_id: BridgeMemoryId) -> Result<(), BridgeError> {
        self.expect_done(&BridgeFrame::ReleaseSharedMemory { bridge_id })
    }

    fn open_session(&self, call: OpenSessionCall<'_>) -> SessionOutcome {
        let frame = BridgeFrame::OpenSession {
            session_id: call.session_id,
            trusted_app: call.trusted_app,
            connection_method: call.connection_method,
            connection_data: call.connection_data,
            operation: call.operation.cloned(),
            key: call.key,
        };
        match self.call(&frame) {
            Ok(BridgeReply::Session(outcome)) => outcome,
            Ok(other) => {
                warn!(reply = ?other, "socket bridge: unexpected reply to open_session");
                SessionOutcome::failed(ReturnCode::COMMUNICATION, ReturnOrigin::Comms)
            }
            Err(e) => {
                warn!(error = %e, "socket bridge: open_session transport failure");
                SessionOutcome::failed(ReturnCode::COMMUNICATION, ReturnOrigin::Comms)
            }
        }
    }

    fn close_session(&self, bridge_id: BridgeSessionId) -> Result<(), BridgeError> {
        self.expect_done(&BridgeFrame::CloseSession { bridge_id })
    }

    fn invoke_command(&self, call: InvokeCall<'_>) -> InvokeOutcome {
        let frame = BridgeFrame::InvokeCommand {
            session: call.session,
            command_id: call.command_id,
            operation: call.operation.cloned(),
            key: call.key,
        };
        match self.call(&frame) {
            Ok(BridgeReply::Invoke(outcome)) => outcome,
            Ok(other) => {
                warn!(reply = ?other, "socket bridge: unexpected reply to invoke_command");
                InvokeOutcome::failed(ReturnCode::COMMUNICATION, ReturnOrigin::Comms)
            }
            Err(e) => {
                warn!(error = %e, "socket bridge: invoke_command transport failure");
                InvokeOutcome::failed(ReturnCode::COMMUNICATION, ReturnOrigin::Comms)
            }
        }
    }

    fn request_cancellation(&self, key: OperationKey) {
        if let Err(e) = self.expect_done(&BridgeFrame::RequestCancellation { key }) {
            debug!(key = %key, error = %e, "socket bridge: cancellation not delivered");
        }
    }
}

fn handle_frame(frame: BridgeFrame, engine: &dyn NativeBridge, transport: &str) -> BridgeReply {
    match frame {
        BridgeFrame::InitializeContext { tee_name } => {
            match engine.initialize_context(tee_name.as_deref(), transport) {
                Ok(token) => BridgeReply::Context { token },
                Err(e) => BridgeReply::failure(e),
            }
        }
        BridgeFrame::FinalizeContext { token } => {
            engine.finalize_context(token);
            BridgeReply::Done
        }
        BridgeFrame::RegisterSharedMemory {
            buffer,
            flags,
            memory_id,
        } => match engine.register_shared_memory(&buffer, flags, memory_id) {
            Ok(bridge_id) => BridgeReply::SharedMemory { bridge_id },
            Err(e) => BridgeReply::failure(e),
        },
        BridgeFrame::ReleaseSharedMemory { bridge_id } => {
            match engine.release_shared_memory(bridge_id) {
                Ok(()) => BridgeReply::Done,
                Err(e) => BridgeReply::failure(e),
            }
        }
        BridgeFrame::OpenSession {
            session_id,
            trusted_app,
            connection_method,
            connection_data,
            operation,
            key,
        } => BridgeReply::Session(engine.open_session(OpenSessionCall {
            session_id,
            trusted_app,
            connection_method,
            connection_data,
            operation: operation.as_ref(),
            key,
        })),
        BridgeFrame::CloseSession { bridge_id } => match engine.close_session(bridge_id) {
            Ok(()) => BridgeReply::Done,
            Err(e) => BridgeReply::failure(e),
        },
        BridgeFrame::InvokeCommand {
            session,
            command_id,
            operation,
            key,
        } => BridgeReply::Invoke(engine.invoke_command(InvokeCall {
            session,
            command_id,
            operation: operation.as_ref(),
            key,
        })),
        BridgeFrame::RequestCancellation { key } => {
            engine.request_cancellation(key);
            BridgeReply::Done
        }
    }
}

/// Answer a single request on an accepted connection.
pub fn serve_connection(
    stream: UnixStream,
    engine: &dyn NativeBridge,
    transport: &str,
) -> Result<(), BridgeError> {
    let reply = match read_frame::<BridgeFrame>(&stream) {
        Ok(Some(frame)) => handle_frame(frame, engine, transport),
        Ok(None) => return Ok(()),
        Err(e) => BridgeReply::failure(e),
    };
    write_frame(&stream, &reply)
}

/// Accept connections forever, one thread per connection.
///
/// Returns only when the listener fails.
pub fn serve(listener: UnixListener, engine: Arc<dyn NativeBridge>) -> Result<(), BridgeError> {
    let transport = listener
        .local_addr()?
        .as_pathname()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "unnamed".to_owned());

    for stream in listener.incoming() {
        let stream = stream?;
        let engine = Arc::clone(&engine);
        let transport = transport.clone();
        thread::spawn(move || {
            if let Err(e) = serve_connection(stream, engine.as_ref(), &transport) {
                warn!(error = %e, "engine server: connection failed");
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tee::{Direction, Parameter};

    #[test]
    fn frames_are_tagged_by_call() {
        let frame = BridgeFrame::RequestCancellation {
            key: OperationKey(7),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["call"], "request_cancellation");
        assert_eq!(json["key"], 7);
    }

    #[test]
    fn invoke_frame_carries_operation() {
        let frame = BridgeFrame::InvokeCommand {
            session: BridgeSessionId(3),
            command_id: 9,
            operation: Some(Operation::new(vec![Parameter::TempMemref {
                buffer: b"abc".to_vec(),
                direction: Direction::Inout,
            }])),
            key: OperationKey(11),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: BridgeFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn failure_reply_maps_back_to_error_kind() {
        let reply = BridgeReply::failure(BridgeError::UnknownHandle("session 4".into()));
        assert!(matches!(reply.into_error(), BridgeError::UnknownHandle(_)));
    }

    #[test]
    fn calls_without_context_fail_without_connecting() {
        let bridge = SocketBridge::new();
        assert!(matches!(
            bridge.close_session(BridgeSessionId(1)),
            Err(BridgeError::Context(_))
        ));
        assert!(matches!(
            bridge.register_shared_memory(b"x", MemoryFlags::INPUT, MemoryId(1)),
            Err(BridgeError::SharedMemory(_))
        ));
        let outcome = bridge.invoke_command(InvokeCall {
            session: BridgeSessionId(1),
            command_id: 1,
            operation: None,
            key: OperationKey(1),
        });
        assert_eq!(outcome.return_code, ReturnCode::COMMUNICATION);
        assert_eq!(outcome.return_origin, ReturnOrigin::Comms);
    }

    #[test]
    fn unreachable_engine_is_a_context_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.sock");
        let bridge = SocketBridge::new();
        assert!(matches!(
            bridge.initialize_context(None, missing.to_str().unwrap()),
            Err(BridgeError::Context(_))
        ));
    }
}
