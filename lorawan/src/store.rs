//! External collaborators: device store, cloud-to-device queue and telemetry sink
//!
//! The network server owns none of these systems. It talks to them through
//! the traits below so any transport (twin store, message broker, HTTP) can
//! be plugged in.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::device::{AESKey, DevAddr, EUI64};
use crate::error::StoreError;
use crate::lorawan::commands::MacCommand;
use crate::lorawan::phy::RadioMetadata;
use crate::lorawan::region::RegionId;

/// Persisted attributes of one device session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionAttributes {
    pub dev_eui: EUI64,
    pub dev_addr: DevAddr,
    pub nwk_skey: AESKey,
    pub app_skey: AESKey,
    /// Application the device belongs to
    pub application_id: Option<String>,
    /// Gateway owning the device; `None` when several gateways share it
    pub gateway_id: Option<String>,
    /// Last accepted uplink counter
    pub fcnt_up: u32,
    /// Next downlink counter to issue
    pub fcnt_down: u32,
    pub fcnt_up_start: u32,
    pub fcnt_down_start: u32,
    /// Reset generation requested by the operator
    pub fcnt_reset_desired: Option<u32>,
    /// Reset generation last honored by a gateway
    pub fcnt_reset_reported: Option<u32>,
    pub supports_32bit_fcnt: bool,
    /// ABP device tolerating counter resets
    pub abp_relaxed: bool,
    /// Preferred receive window, 1 or 2
    pub preferred_window: u8,
    /// RX1 delay in seconds (0 means 1)
    pub rx_delay: u8,
    pub rx1_dr_offset: u8,
    /// RX2 data rate index overriding the region default
    pub rx2_data_rate: Option<u8>,
    pub region: Option<RegionId>,
    pub downlink_enabled: bool,
    pub keep_alive_timeout: Option<Duration>,
    /// ADR state last commanded to the device
    pub data_rate: Option<u8>,
    pub tx_power: Option<u8>,
    pub nb_rep: Option<u8>,
    /// DevNonce of the join that created this session
    pub dev_nonce: Option<u16>,
}

impl SessionAttributes {
    /// Attributes of an ABP device with zeroed counters and default preferences
    pub fn new(dev_eui: EUI64, dev_addr: DevAddr, nwk_skey: AESKey, app_skey: AESKey) -> Self {
        Self {
            dev_eui,
            dev_addr,
            nwk_skey,
            app_skey,
            application_id: None,
            gateway_id: None,
            fcnt_up: 0,
            fcnt_down: 0,
            fcnt_up_start: 0,
            fcnt_down_start: 0,
            fcnt_reset_desired: None,
            fcnt_reset_reported: None,
            supports_32bit_fcnt: false,
            abp_relaxed: false,
            preferred_window: 1,
            rx_delay: 0,
            rx1_dr_offset: 0,
            rx2_data_rate: None,
            region: None,
            downlink_enabled: true,
            keep_alive_timeout: None,
            data_rate: None,
            tx_power: None,
            nb_rep: None,
            dev_nonce: None,
        }
    }
}

/// Device registered under a radio address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub dev_addr: DevAddr,
    pub dev_eui: EUI64,
}

/// Changed session fields; `None` leaves the stored value untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionDelta {
    pub dev_addr: Option<DevAddr>,
    pub nwk_skey: Option<AESKey>,
    pub app_skey: Option<AESKey>,
    pub dev_nonce: Option<u16>,
    pub gateway_id: Option<String>,
    pub fcnt_up: Option<u32>,
    pub fcnt_down: Option<u32>,
    pub fcnt_up_start: Option<u32>,
    pub fcnt_down_start: Option<u32>,
    pub fcnt_reset_reported: Option<u32>,
    pub data_rate: Option<u8>,
    pub tx_power: Option<u8>,
    pub nb_rep: Option<u8>,
}

impl SessionDelta {
    /// Every field of a freshly joined session
    pub fn full(attrs: &SessionAttributes) -> Self {
        Self {
            dev_addr: Some(attrs.dev_addr),
            nwk_skey: Some(attrs.nwk_skey),
            app_skey: Some(attrs.app_skey),
            dev_nonce: attrs.dev_nonce,
            gateway_id: attrs.gateway_id.clone(),
            fcnt_up: Some(attrs.fcnt_up),
            fcnt_down: Some(attrs.fcnt_down),
            fcnt_up_start: Some(attrs.fcnt_up_start),
            fcnt_down_start: Some(attrs.fcnt_down_start),
            fcnt_reset_reported: attrs.fcnt_reset_reported,
            data_rate: attrs.data_rate,
            tx_power: attrs.tx_power,
            nb_rep: attrs.nb_rep,
        }
    }

    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Provisioning data needed to accept a join request
#[derive(Debug, Clone, PartialEq)]
pub struct JoinInfo {
    pub app_key: AESKey,
    pub join_eui: EUI64,
    pub application_id: Option<String>,
    pub gateway_id: Option<String>,
    pub region: Option<RegionId>,
    pub preferred_window: u8,
    pub rx_delay: u8,
    pub rx1_dr_offset: u8,
    pub rx2_data_rate: Option<u8>,
    pub supports_32bit_fcnt: bool,
    pub downlink_enabled: bool,
    pub keep_alive_timeout: Option<Duration>,
    /// DevNonce of the last accepted join
    pub last_dev_nonce: Option<u16>,
}

impl JoinInfo {
    /// Join info with default preferences
    pub fn new(app_key: AESKey, join_eui: EUI64) -> Self {
        Self {
            app_key,
            join_eui,
            application_id: None,
            gateway_id: None,
            region: None,
            preferred_window: 1,
            rx_delay: 0,
            rx1_dr_offset: 0,
            rx2_data_rate: None,
            supports_32bit_fcnt: false,
            downlink_enabled: true,
            keep_alive_timeout: None,
            last_dev_nonce: None,
        }
    }
}

/// System of record for device identity and session state
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Load one session; `None` when the device is unknown
    async fn fetch_session(&self, dev_eui: EUI64) -> Result<Option<SessionAttributes>, StoreError>;

    /// Devices currently registered under a radio address
    async fn fetch_candidates_by_address(
        &self,
        dev_addr: DevAddr,
    ) -> Result<Vec<DeviceCandidate>, StoreError>;

    /// Write changed fields
    async fn persist_session_delta(
        &self,
        dev_eui: EUI64,
        delta: SessionDelta,
    ) -> Result<(), StoreError>;

    /// Allocate the downlink counter for a shared device.
    ///
    /// Returns `None` when another gateway already answered the uplink
    /// carrying `fcnt_up`.
    async fn allocate_next_downlink_counter(
        &self,
        dev_eui: EUI64,
        current: u32,
        fcnt_up: u32,
        gateway_id: &str,
    ) -> Result<Option<u32>, StoreError>;

    /// Drop the shared counter cache after a reset
    async fn reset_frame_counter_cache(
        &self,
        dev_eui: EUI64,
        generation: Option<u32>,
        gateway_id: &str,
    ) -> Result<(), StoreError>;

    /// Provisioning data for OTAA; `None` when the device is unknown
    async fn fetch_join_info(&self, dev_eui: EUI64) -> Result<Option<JoinInfo>, StoreError>;
}

/// Cloud-to-device message waiting for a downlink slot
#[derive(Debug, Clone, PartialEq)]
pub struct CloudMessage {
    pub id: String,
    pub f_port: u8,
    pub payload: Vec<u8>,
    pub confirmed: bool,
    /// MAC commands requested by the application
    pub mac_commands: Vec<MacCommand>,
    /// After this instant the message must not be delivered
    pub expires_at: Option<Instant>,
}

impl CloudMessage {
    /// Encoded size of the message in a frame
    pub fn size(&self) -> usize {
        self.payload.len() + crate::lorawan::commands::encoded_len(&self.mac_commands)
    }
}

/// Queue of cloud-to-device messages
#[async_trait]
pub trait CloudMessageQueue: Send + Sync {
    /// Wait up to `wait` for the next message of a device
    async fn receive(
        &self,
        dev_eui: EUI64,
        wait: Duration,
    ) -> Result<Option<CloudMessage>, StoreError>;

    /// Message was sent; remove it
    async fn complete(&self, dev_eui: EUI64, message: &CloudMessage) -> Result<(), StoreError>;

    /// Message was not sent; retry later
    async fn abandon(&self, dev_eui: EUI64, message: &CloudMessage) -> Result<(), StoreError>;

    /// Message can never be sent; discard it
    async fn reject(&self, dev_eui: EUI64, message: &CloudMessage) -> Result<(), StoreError>;
}

/// Application payload forwarded upstream
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    pub dev_eui: EUI64,
    pub dev_addr: DevAddr,
    pub fcnt: u32,
    pub f_port: Option<u8>,
    /// Decrypted FRMPayload
    pub payload: Vec<u8>,
    pub confirmed: bool,
    pub metadata: RadioMetadata,
}

/// Upstream consumer of telemetry
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn send(&self, telemetry: Telemetry) -> Result<(), StoreError>;
}
