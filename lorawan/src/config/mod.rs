//! Server and device configuration
//!
//! This module contains the network server configuration and the identifier
//! types shared by every other module:
//! - Server configuration (`ServerConfig`) loaded from file and environment
//! - Device identifiers and keys (DevEUI, DevAddr, NetID, AES keys)

/// Device identifiers and key material
pub mod device;

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::lorawan::region::RegionId;

pub use device::{AESKey, DevAddr, NetId, ParseIdError, EUI64};

/// Prefix of environment variables read by [`ServerConfig::load`]
pub const ENV_PREFIX: &str = "LORANS";

/// ADR tuning
#[derive(Debug, Clone, Deserialize)]
pub struct AdrConfig {
    /// Number of uplink samples kept per device and required before computing
    #[serde(default = "default_adr_history_size")]
    pub history_size: usize,
    /// Safety margin subtracted from the measured SNR headroom
    #[serde(default = "default_adr_margin_db")]
    pub installation_margin_db: f32,
}

impl Default for AdrConfig {
    fn default() -> Self {
        Self {
            history_size: default_adr_history_size(),
            installation_margin_db: default_adr_margin_db(),
        }
    }
}

/// Network server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Identity of this gateway/server instance, used for device ownership
    #[serde(default = "default_gateway_id")]
    pub gateway_id: String,
    /// Network id; its NwkID bits must match incoming DevAddrs
    #[serde(default)]
    pub net_id: NetId,
    /// DevAddrs accepted even when their NwkID is foreign
    #[serde(default)]
    pub allowed_dev_addrs: Vec<DevAddr>,
    /// Region used by sessions that do not state one
    #[serde(default)]
    pub default_region: RegionId,
    /// Lifetime of a radio-address cache entry
    #[serde(default = "default_reload_interval")]
    pub dev_addr_reload_interval_ms: u64,
    /// Sessions not used for this long are dropped from memory
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_ms: u64,
    /// Upper bound for loading one candidate session during resolution
    #[serde(default = "default_candidate_fetch_timeout")]
    pub candidate_fetch_timeout_ms: u64,
    /// Largest accepted forward jump of the uplink frame counter
    #[serde(default = "default_max_fcnt_gap")]
    pub max_fcnt_gap: u32,
    /// Unsaved frame counter delta that forces a write to the device store;
    /// reaching it is enough
    #[serde(default = "default_fcnt_save_delta")]
    pub fcnt_save_delta: u32,
    /// How many resubmits of a confirmed uplink are answered
    #[serde(default = "default_max_resubmits")]
    pub max_confirmation_resubmits: u32,
    /// Time needed to package and hand a downlink to the packet forwarder
    #[serde(default = "default_expected_processing_time")]
    pub expected_processing_time_ms: u64,
    /// Minimum budget left before looking for a cloud-to-device message
    #[serde(default = "default_min_cloud_check_time")]
    pub min_cloud_check_time_ms: u64,
    /// ADR settings
    #[serde(default)]
    pub adr: AdrConfig,
    /// Fallback tracing directive when `RUST_LOG` is not set
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            gateway_id: default_gateway_id(),
            net_id: NetId::default(),
            allowed_dev_addrs: Vec::new(),
            default_region: RegionId::default(),
            dev_addr_reload_interval_ms: default_reload_interval(),
            session_idle_timeout_ms: default_session_idle_timeout(),
            candidate_fetch_timeout_ms: default_candidate_fetch_timeout(),
            max_fcnt_gap: default_max_fcnt_gap(),
            fcnt_save_delta: default_fcnt_save_delta(),
            max_confirmation_resubmits: default_max_resubmits(),
            expected_processing_time_ms: default_expected_processing_time(),
            min_cloud_check_time_ms: default_min_cloud_check_time(),
            adr: AdrConfig::default(),
            log_filter: default_log_filter(),
        }
    }
}

impl ServerConfig {
    /// Load from an optional file and `LORANS__*` environment variables.
    ///
    /// Environment values win over the file; nested keys use `__`
    /// (`LORANS__ADR__HISTORY_SIZE=10`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let cfg: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("allowed_dev_addrs")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway_id.trim().is_empty() {
            return Err(ConfigError::Invalid("gateway_id must not be empty".into()));
        }
        if self.max_fcnt_gap == 0 {
            return Err(ConfigError::Invalid("max_fcnt_gap must be positive".into()));
        }
        if self.adr.history_size == 0 {
            return Err(ConfigError::Invalid("adr.history_size must be positive".into()));
        }
        if self.expected_processing_time_ms >= 1000 {
            return Err(ConfigError::Invalid(
                "expected_processing_time_ms leaves no room for the first receive window".into(),
            ));
        }
        Ok(())
    }

    /// Whether uplinks from this address are served by this network
    pub fn accepts_dev_addr(&self, dev_addr: DevAddr) -> bool {
        dev_addr.nwk_id() == self.net_id.nwk_id() || self.allowed_dev_addrs.contains(&dev_addr)
    }

    /// Radio-address cache lifetime
    pub fn dev_addr_reload_interval(&self) -> Duration {
        Duration::from_millis(self.dev_addr_reload_interval_ms)
    }

    /// Session idle eviction
    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.session_idle_timeout_ms)
    }

    /// Per-candidate fetch timeout
    pub fn candidate_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.candidate_fetch_timeout_ms)
    }

    /// Packaging budget reserved before each receive window
    pub fn expected_processing_time(&self) -> Duration {
        Duration::from_millis(self.expected_processing_time_ms)
    }

    /// Minimum time worth spending on a cloud message check
    pub fn min_cloud_check_time(&self) -> Duration {
        Duration::from_millis(self.min_cloud_check_time_ms)
    }
}

fn default_gateway_id() -> String {
    "gateway".to_string()
}

fn default_reload_interval() -> u64 {
    30_000
}

fn default_session_idle_timeout() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_candidate_fetch_timeout() -> u64 {
    2_000
}

fn default_max_fcnt_gap() -> u32 {
    16_384
}

fn default_fcnt_save_delta() -> u32 {
    10
}

fn default_max_resubmits() -> u32 {
    3
}

fn default_expected_processing_time() -> u64 {
    300
}

fn default_min_cloud_check_time() -> u64 {
    200
}

fn default_adr_history_size() -> usize {
    20
}

fn default_adr_margin_db() -> f32 {
    5.0
}

fn default_log_filter() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ServerConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.max_fcnt_gap, 16_384);
        assert_eq!(cfg.expected_processing_time(), Duration::from_millis(300));
    }

    #[test]
    fn net_id_filter_uses_nwk_id_bits() {
        let cfg = ServerConfig {
            net_id: NetId::new(0x000013),
            allowed_dev_addrs: vec![DevAddr::from_u32(0x0000_0001)],
            ..ServerConfig::default()
        };
        assert!(cfg.accepts_dev_addr("260B1234".parse().unwrap()));
        assert!(cfg.accepts_dev_addr(DevAddr::from_u32(1)));
        assert!(!cfg.accepts_dev_addr(DevAddr::from_u32(0x0200_0000)));
    }

    #[test]
    fn empty_gateway_id_is_rejected() {
        let cfg = ServerConfig {
            gateway_id: " ".into(),
            ..ServerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
