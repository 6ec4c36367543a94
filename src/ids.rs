// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Identifier newtypes.
//!
//! Every resource lives in two numbering spaces at once: the id the Client
//! Application chose (caller-facing) and the id the native bridge handed back
//! (bridge-assigned). Keeping them as distinct types makes it impossible to
//! pass one where the other is expected.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Identity of a connected Client Application (its process id).
    CallerId(u32)
);

id_type!(
    /// Session id chosen by the Client Application.
    SessionId(u32)
);

id_type!(
    /// Session id assigned by the native bridge.
    BridgeSessionId(u32)
);

id_type!(
    /// Shared memory id chosen by the Client Application.
    MemoryId(u32)
);

id_type!(
    /// Shared memory id assigned by the native bridge.
    BridgeMemoryId(u32)
);

id_type!(
    /// Operation id chosen by the Client Application to target cancellation.
    ClientOperationId(u32)
);

id_type!(
    /// Engine-wide key of one in-flight open/invoke call.
    OperationKey(u64)
);

id_type!(
    /// Token returned by the bridge for an initialized engine context.
    ContextToken(u64)
);
