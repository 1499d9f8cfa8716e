//! IPC configuration
//!
//! Every bound the IPC core enforces comes from [`IpcConfig`]. The values
//! can be loaded from a TOML document; missing keys fall back to defaults.
//!
//! ```toml
//! max_payload_size = 2048
//! max_endpoints = 128
//! fast_ipc_buffer_size = 8192
//!
//! [bridge]
//! lease_secs = 30
//! max_lifetime_secs = 600
//! ```

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::codec::MAX_PAYLOAD_SIZE;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{field} must be non-zero")]
    Zero { field: &'static str },

    #[error("max_payload_size {value} exceeds wire maximum {max}")]
    PayloadTooLarge { value: usize, max: usize },

    #[error("fast_ipc_buffer_size {0} is not a power of two")]
    NotPowerOfTwo(usize),

    #[error("bridge lease ({lease_secs}s) exceeds max lifetime ({max_lifetime_secs}s)")]
    LeaseExceedsLifetime { lease_secs: u64, max_lifetime_secs: u64 },

    #[error("max_capabilities is {configured} but the registry holds {registry}")]
    CapacityMismatch { configured: usize, registry: usize },
}

/// Bounds for the IPC core
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IpcConfig {
    /// Largest payload any envelope may carry
    pub max_payload_size: usize,
    /// Live endpoints system-wide
    pub max_endpoints: usize,
    /// Capability registry entries system-wide
    pub max_capabilities: usize,
    /// Calls waiting for a reply, system-wide
    pub max_outstanding_calls: usize,
    /// Largest fast ring channel capacity (power of two)
    pub fast_ipc_buffer_size: usize,
    /// Queued envelopes per endpoint before `send` reports `WouldBlock`
    pub mailbox_depth: usize,
    /// Byte budget of the buffer pool
    pub buffer_pool_bytes: usize,
    /// Capability bridge lease policy
    pub bridge: BridgeConfig,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_SIZE,
            max_endpoints: 256,
            max_capabilities: cap_broker::DEFAULT_MAX_CAPABILITIES,
            max_outstanding_calls: 1024,
            fast_ipc_buffer_size: 64 * 1024,
            mailbox_depth: 64,
            buffer_pool_bytes: 4 * 1024 * 1024,
            bridge: BridgeConfig::default(),
        }
    }
}

/// Lease policy of the bridge authority
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Lifetime of a freshly constructed proof, and of each refresh
    pub lease_secs: u64,
    /// Absolute cap on a proof's lifetime, counted from construction
    pub max_lifetime_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            lease_secs: 30,
            max_lifetime_secs: 300,
        }
    }
}

impl BridgeConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }
}

impl IpcConfig {
    /// Parse and validate a TOML document
    ///
    /// # Errors
    /// Returns `ConfigError::Parse` for malformed TOML or unknown keys, and
    /// any error reported by [`IpcConfig::validate`]
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: IpcConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the bounds for consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("max_payload_size", self.max_payload_size),
            ("max_endpoints", self.max_endpoints),
            ("max_capabilities", self.max_capabilities),
            ("max_outstanding_calls", self.max_outstanding_calls),
            ("fast_ipc_buffer_size", self.fast_ipc_buffer_size),
            ("mailbox_depth", self.mailbox_depth),
            ("buffer_pool_bytes", self.buffer_pool_bytes),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }

        if self.max_payload_size > MAX_PAYLOAD_SIZE {
            return Err(ConfigError::PayloadTooLarge {
                value: self.max_payload_size,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if !self.fast_ipc_buffer_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo(self.fast_ipc_buffer_size));
        }

        if self.bridge.lease_secs == 0 {
            return Err(ConfigError::Zero { field: "bridge.lease_secs" });
        }
        if self.bridge.lease_secs > self.bridge.max_lifetime_secs {
            return Err(ConfigError::LeaseExceedsLifetime {
                lease_secs: self.bridge.lease_secs,
                max_lifetime_secs: self.bridge.max_lifetime_secs,
            });
        }

        Ok(())
    }
}
