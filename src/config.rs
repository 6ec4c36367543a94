// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Environment variable names, their defaults, and the loader that turns them
//! into a [`ProxyConfig`] at startup. Invalid values fall back to the default
//! with a warning rather than aborting startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `HOST` | Server bind address | `127.0.0.1` |
//! | `PORT` | Server bind port | `8787` |
//! | `TEE_NAME` | TEE to connect to | unset (default TEE) |
//! | `TEE_TRANSPORT` | Engine socket path | `/tmp/open_tee_socket` |
//! | `TEE_BRIDGE` | `socket` or `loopback` | `socket` |
//! | `MAX_INFLIGHT_CALLS` | Concurrent blocking engine calls | `32` |
//! | `MAX_SHARED_MEMORY_SIZE` | Byte cap per shared memory region | `16777216` |
//! | `FINALIZE_WHEN_IDLE` | Finalize the engine context when the last caller leaves | `false` |
//! | `CALLER_REAP_INTERVAL_SECS` | Dead caller sweep interval, `0` disables | `10` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8787;

/// Name of the TEE to connect to. Unset selects the engine's default TEE.
pub const TEE_NAME_ENV: &str = "TEE_NAME";

/// Path of the engine's Unix socket.
pub const TEE_TRANSPORT_ENV: &str = "TEE_TRANSPORT";
pub const DEFAULT_TEE_TRANSPORT: &str = "/tmp/open_tee_socket";

/// Bridge implementation: `socket` (real engine) or `loopback` (in-process).
pub const TEE_BRIDGE_ENV: &str = "TEE_BRIDGE";

pub const MAX_INFLIGHT_CALLS_ENV: &str = "MAX_INFLIGHT_CALLS";
pub const DEFAULT_MAX_INFLIGHT_CALLS: usize = 32;

pub const MAX_SHARED_MEMORY_SIZE_ENV: &str = "MAX_SHARED_MEMORY_SIZE";
pub const DEFAULT_MAX_SHARED_MEMORY_SIZE: usize = 16 * 1024 * 1024;

pub const FINALIZE_WHEN_IDLE_ENV: &str = "FINALIZE_WHEN_IDLE";

pub const CALLER_REAP_INTERVAL_ENV: &str = "CALLER_REAP_INTERVAL_SECS";
pub const DEFAULT_CALLER_REAP_INTERVAL_SECS: u64 = 10;

/// Logging format: `json` for structured output, anything else for pretty.
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";
pub const DEFAULT_LOG_FILTER: &str = "info,tower_http=debug";

/// Header carrying the caller identity (its process id).
pub const CALLER_ID_HEADER: &str = "x-caller-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BridgeKind {
    #[default]
    Socket,
    Loopback,
}

impl FromStr for BridgeKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "socket" => Ok(Self::Socket),
            "loopback" => Ok(Self::Loopback),
            other => Err(format!("unknown bridge {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match env::var(LOG_FORMAT_ENV) {
            Ok(value) if value.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Everything the binary reads from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub tee_name: Option<String>,
    pub transport: String,
    pub bridge: BridgeKind,
    pub max_inflight_calls: usize,
    pub max_shared_memory: usize,
    pub finalize_when_idle: bool,
    /// `None` disables the reaper.
    pub reap_interval: Option<Duration>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            tee_name: None,
            transport: DEFAULT_TEE_TRANSPORT.to_owned(),
            bridge: BridgeKind::default(),
            max_inflight_calls: DEFAULT_MAX_INFLIGHT_CALLS,
            max_shared_memory: DEFAULT_MAX_SHARED_MEMORY_SIZE,
            finalize_when_idle: false,
            reap_interval: Some(Duration::from_secs(DEFAULT_CALLER_REAP_INTERVAL_SECS)),
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let reap_secs = parse_or(&lookup, CALLER_REAP_INTERVAL_ENV, DEFAULT_CALLER_REAP_INTERVAL_SECS);
        let max_inflight_calls = match parse_or(&lookup, MAX_INFLIGHT_CALLS_ENV, DEFAULT_MAX_INFLIGHT_CALLS) {
            0 => {
                warn!(variable = MAX_INFLIGHT_CALLS_ENV, "must be positive, using default");
                DEFAULT_MAX_INFLIGHT_CALLS
            }
            n => n,
        };

        Self {
            host: non_empty(HOST_ENV).unwrap_or(defaults.host),
            port: parse_or(&lookup, PORT_ENV, DEFAULT_PORT),
            tee_name: non_empty(TEE_NAME_ENV),
            transport: non_empty(TEE_TRANSPORT_ENV).unwrap_or(defaults.transport),
            bridge: parse_or(&lookup, TEE_BRIDGE_ENV, BridgeKind::default()),
            max_inflight_calls,
            max_shared_memory: parse_or(&lookup, MAX_SHARED_MEMORY_SIZE_ENV, DEFAULT_MAX_SHARED_MEMORY_SIZE),
            finalize_when_idle: parse_or(&lookup, FINALIZE_WHEN_IDLE_ENV, false),
            reap_interval: (reap_secs > 0).then(|| Duration::from_secs(reap_secs)),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(name) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(variable = name, value = %raw, "invalid value, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> ProxyConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ProxyConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(config(&[]), ProxyConfig::default());
        assert_eq!(config(&[]).bind_address(), "127.0.0.1:8787");
    }

    #[test]
    fn values_are_read() {
        let cfg = config(&[
            ("PORT", "9000"),
            ("TEE_NAME", "optee"),
            ("TEE_BRIDGE", "Loopback"),
            ("MAX_INFLIGHT_CALLS", "4"),
            ("FINALIZE_WHEN_IDLE", "true"),
            ("CALLER_REAP_INTERVAL_SECS", "0"),
        ]);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.tee_name.as_deref(), Some("optee"));
        assert_eq!(cfg.bridge, BridgeKind::Loopback);
        assert_eq!(cfg.max_inflight_calls, 4);
        assert!(cfg.finalize_when_idle);
        assert_eq!(cfg.reap_interval, None);
    }

    #[test]
    fn invalid_values_fall_back() {
        let cfg = config(&[
            ("PORT", "not-a-port"),
            ("TEE_BRIDGE", "carrier-pigeon"),
            ("MAX_INFLIGHT_CALLS", "0"),
            ("MAX_SHARED_MEMORY_SIZE", "-1"),
            ("TEE_NAME", "  "),
        ]);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.bridge, BridgeKind::Socket);
        assert_eq!(cfg.max_inflight_calls, DEFAULT_MAX_INFLIGHT_CALLS);
        assert_eq!(cfg.max_shared_memory, DEFAULT_MAX_SHARED_MEMORY_SIZE);
        assert_eq!(cfg.tee_name, None);
    }
}
