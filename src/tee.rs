// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! GlobalPlatform TEE Client API value types.
//!
//! Return codes, return origins, login methods and the operation payload that
//! travels with `open_session` and `invoke_command`. Values match
//! `tee_client_api.h`.

use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Maximum number of parameters carried by one operation.
pub const MAX_PARAMS: usize = 4;

/// A `TEEC_Result` value.
///
/// Codes the proxy does not know by name are carried through verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct ReturnCode(pub u32);

impl ReturnCode {
    pub const SUCCESS: Self = Self(0x0000_0000);
    pub const GENERIC: Self = Self(0xFFFF_0000);
    pub const ACCESS_DENIED: Self = Self(0xFFFF_0001);
    pub const CANCEL: Self = Self(0xFFFF_0002);
    pub const ACCESS_CONFLICT: Self = Self(0xFFFF_0003);
    pub const EXCESS_DATA: Self = Self(0xFFFF_0004);
    pub const BAD_FORMAT: Self = Self(0xFFFF_0005);
    pub const BAD_PARAMETERS: Self = Self(0xFFFF_0006);
    pub const BAD_STATE: Self = Self(0xFFFF_0007);
    pub const ITEM_NOT_FOUND: Self = Self(0xFFFF_0008);
    pub const NOT_IMPLEMENTED: Self = Self(0xFFFF_0009);
    pub const NOT_SUPPORTED: Self = Self(0xFFFF_000A);
    pub const NO_DATA: Self = Self(0xFFFF_000B);
    pub const OUT_OF_MEMORY: Self = Self(0xFFFF_000C);
    pub const BUSY: Self = Self(0xFFFF_000D);
    pub const COMMUNICATION: Self = Self(0xFFFF_000E);
    pub const SECURITY: Self = Self(0xFFFF_000F);
    pub const SHORT_BUFFER: Self = Self(0xFFFF_0010);
    pub const EXTERNAL_CANCEL: Self = Self(0xFFFF_0011);
    pub const TARGET_DEAD: Self = Self(0xFFFF_3024);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// True when the engine reports that the operation was cancelled.
    pub fn is_cancel(self) -> bool {
        self == Self::CANCEL || self == Self::EXTERNAL_CANCEL
    }

    /// Symbolic name of a known code.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::SUCCESS => "TEEC_SUCCESS",
            Self::GENERIC => "TEEC_ERROR_GENERIC",
            Self::ACCESS_DENIED => "TEEC_ERROR_ACCESS_DENIED",
            Self::CANCEL => "TEEC_ERROR_CANCEL",
            Self::ACCESS_CONFLICT => "TEEC_ERROR_ACCESS_CONFLICT",
            Self::EXCESS_DATA => "TEEC_ERROR_EXCESS_DATA",
            Self::BAD_FORMAT => "TEEC_ERROR_BAD_FORMAT",
            Self::BAD_PARAMETERS => "TEEC_ERROR_BAD_PARAMETERS",
            Self::BAD_STATE => "TEEC_ERROR_BAD_STATE",
            Self::ITEM_NOT_FOUND => "TEEC_ERROR_ITEM_NOT_FOUND",
            Self::NOT_IMPLEMENTED => "TEEC_ERROR_NOT_IMPLEMENTED",
            Self::NOT_SUPPORTED => "TEEC_ERROR_NOT_SUPPORTED",
            Self::NO_DATA => "TEEC_ERROR_NO_DATA",
            Self::OUT_OF_MEMORY => "TEEC_ERROR_OUT_OF_MEMORY",
            Self::BUSY => "TEEC_ERROR_BUSY",
            Self::COMMUNICATION => "TEEC_ERROR_COMMUNICATION",
            Self::SECURITY => "TEEC_ERROR_SECURITY",
            Self::SHORT_BUFFER => "TEEC_ERROR_SHORT_BUFFER",
            Self::EXTERNAL_CANCEL => "TEE_ERROR_EXTERNAL_CANCEL",
            Self::TARGET_DEAD => "TEEC_ERROR_TARGET_DEAD",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({:#010x})", self.0),
            None => write!(f, "{:#010x}", self.0),
        }
    }
}

/// Where a return code originated (`TEEC_ORIGIN_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReturnOrigin {
    Api,
    Comms,
    Tee,
    TrustedApp,
}

impl ReturnOrigin {
    pub fn code(self) -> u32 {
        match self {
            Self::Api => 1,
            Self::Comms => 2,
            Self::Tee => 3,
            Self::TrustedApp => 4,
        }
    }
}

/// Login method used when opening a session (`TEEC_LOGIN_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMethod {
    #[default]
    Public,
    User,
    Group,
    Application,
    UserApplication,
    GroupApplication,
}

impl ConnectionMethod {
    pub fn code(self) -> u32 {
        match self {
            Self::Public => 0x0,
            Self::User => 0x1,
            Self::Group => 0x2,
            Self::Application => 0x4,
            Self::UserApplication => 0x5,
            Self::GroupApplication => 0x6,
        }
    }
}

/// Shared memory direction bit vector (`TEEC_MEM_INPUT` / `TEEC_MEM_OUTPUT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct MemoryFlags(pub u32);

impl MemoryFlags {
    pub const INPUT: Self = Self(0x1);
    pub const OUTPUT: Self = Self(0x2);
    pub const INOUT: Self = Self(0x3);

    pub fn is_valid(self) -> bool {
        self.0 != 0 && self.0 & !Self::INOUT.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Data direction of one parameter, as seen by the Trusted Application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
    Inout,
}

/// One operation parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Parameter {
    None,
    /// A pair of integers.
    Value { a: u32, b: u32, direction: Direction },
    /// A buffer copied with the call.
    TempMemref {
        #[serde(with = "base64_bytes")]
        #[schema(value_type = String, format = Byte)]
        buffer: Vec<u8>,
        direction: Direction,
    },
    /// A window into previously registered shared memory.
    ///
    /// `memory_id` is caller-facing between Client Application and proxy and
    /// bridge-assigned between proxy and engine.
    ///
    /// `contents` carries the window's bytes. On the way in it holds what the
    /// caller wrote since the last call (input and inout windows only); on the
    /// way out it holds what the Trusted Application left there (output and
    /// inout windows only). When present it is exactly `size` bytes long.
    RegisteredMemref {
        memory_id: u32,
        #[serde(default)]
        offset: u32,
        size: u32,
        direction: Direction,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            with = "optional_base64_bytes"
        )]
        #[schema(value_type = Option<String>, format = Byte)]
        contents: Option<Vec<u8>>,
    },
}

/// Payload of an open-session or invoke-command call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
pub struct Operation {
    #[serde(default)]
    pub params: Vec<Parameter>,
}

impl Operation {
    pub fn new(params: Vec<Parameter>) -> Self {
        Self { params }
    }

    pub fn is_well_formed(&self) -> bool {
        self.check().is_ok()
    }

    /// Describe the first structural problem, if any.
    pub fn check(&self) -> Result<(), String> {
        if self.params.len() > MAX_PARAMS {
            return Err(format!(
                "operation has {} parameters, at most {MAX_PARAMS} allowed",
                self.params.len()
            ));
        }
        for (index, param) in self.params.iter().enumerate() {
            if let Parameter::RegisteredMemref {
                size,
                contents: Some(contents),
                ..
            } = param
            {
                if contents.len() != *size as usize {
                    return Err(format!(
                        "parameter {index} carries {} bytes for a {size} byte window",
                        contents.len()
                    ));
                }
            }
        }
        Ok(())
    }

    /// Registered memory ids referenced by this operation, in parameter order.
    pub fn memory_refs(&self) -> impl Iterator<Item = u32> + '_ {
        self.params.iter().filter_map(|param| match param {
            Parameter::RegisteredMemref { memory_id, .. } => Some(*memory_id),
            _ => None,
        })
    }

    /// Rewrite every registered memory reference through `translate`.
    ///
    /// Fails with the first id `translate` rejects; `self` is left untouched
    /// in that case.
    pub fn rewrite_memory_refs<F>(&self, mut translate: F) -> Result<Operation, u32>
    where
        F: FnMut(u32) -> Option<u32>,
    {
        let mut rewritten = self.clone();
        for param in &mut rewritten.params {
            if let Parameter::RegisteredMemref { memory_id, .. } = param {
                *memory_id = translate(*memory_id).ok_or(*memory_id)?;
            }
        }
        Ok(rewritten)
    }
}

/// Serde adapter carrying byte buffers as base64 strings.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// [`base64_bytes`] for optional buffers; `null` and a missing field both mean `None`.
pub mod optional_base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => super::base64_bytes::serialize(bytes, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_code_names_and_display() {
        assert_eq!(ReturnCode::CANCEL.name(), Some("TEEC_ERROR_CANCEL"));
        assert_eq!(ReturnCode(0x1234).name(), None);
        assert_eq!(ReturnCode(0x1234).to_string(), "0x00001234");
        assert_eq!(
            ReturnCode::BAD_PARAMETERS.to_string(),
            "TEEC_ERROR_BAD_PARAMETERS (0xffff0006)"
        );
        assert!(ReturnCode::EXTERNAL_CANCEL.is_cancel());
        assert!(!ReturnCode::GENERIC.is_cancel());
    }

    #[test]
    fn memory_flags_validation() {
        assert!(MemoryFlags::INPUT.is_valid());
        assert!(MemoryFlags::INOUT.is_valid());
        assert!(!MemoryFlags(0).is_valid());
        assert!(!MemoryFlags(0x8).is_valid());
        assert!(MemoryFlags::INOUT.contains(MemoryFlags::OUTPUT));
        assert!(!MemoryFlags::INPUT.contains(MemoryFlags::OUTPUT));
    }

    #[test]
    fn rewrite_only_touches_registered_references() {
        let op = Operation::new(vec![
            Parameter::Value {
                a: 7,
                b: 0,
                direction: Direction::Input,
            },
            Parameter::RegisteredMemref {
                memory_id: 3,
                offset: 0,
                size: 16,
                direction: Direction::Inout,
                contents: None,
            },
        ]);

        let rewritten = op.rewrite_memory_refs(|id| Some(id + 100)).unwrap();
        assert_eq!(rewritten.memory_refs().collect::<Vec<_>>(), vec![103]);
        assert_eq!(rewritten.params[0], op.params[0]);

        let err = op.rewrite_memory_refs(|_| None).unwrap_err();
        assert_eq!(err, 3);
    }

    #[test]
    fn operation_json_uses_base64_buffers() {
        let op = Operation::new(vec![Parameter::TempMemref {
            buffer: b"hi".to_vec(),
            direction: Direction::Input,
        }]);
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(
            json,
            r#"{"params":[{"type":"temp_memref","buffer":"aGk=","direction":"input"}]}"#
        );
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn too_many_params_is_not_well_formed() {
        let op = Operation::new(vec![Parameter::None; MAX_PARAMS + 1]);
        assert!(!op.is_well_formed());
    }

    #[test]
    fn registered_contents_must_fill_the_window() {
        let window = |contents: Option<Vec<u8>>| {
            Operation::new(vec![Parameter::RegisteredMemref {
                memory_id: 1,
                offset: 2,
                size: 4,
                direction: Direction::Inout,
                contents,
            }])
        };
        assert!(window(None).is_well_formed());
        assert!(window(Some(vec![1, 2, 3, 4])).is_well_formed());
        let err = window(Some(vec![1, 2])).check().unwrap_err();
        assert!(err.contains("2 bytes for a 4 byte window"), "{err}");
    }

    #[test]
    fn registered_contents_travel_as_base64() {
        let op = Operation::new(vec![Parameter::RegisteredMemref {
            memory_id: 1,
            offset: 0,
            size: 2,
            direction: Direction::Output,
            contents: Some(b"hi".to_vec()),
        }]);
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["params"][0]["contents"], "aGk=");

        let bare: Operation = serde_json::from_str(
            r#"{"params":[{"type":"registered_memref","memory_id":1,"size":2,"direction":"input"}]}"#,
        )
        .unwrap();
        assert!(matches!(
            bare.params[0],
            Parameter::RegisteredMemref { contents: None, offset: 0, .. }
        ));
    }
}
