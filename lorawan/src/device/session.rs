use std::time::Duration;

use tracing::debug;

use super::adr::{AdrHistory, AdrSettings};
use super::fcnt::{self, FcntState};
use crate::config::device::{AESKey, DevAddr, EUI64};
use crate::config::ServerConfig;
use crate::lorawan::phy::TimingParams;
use crate::lorawan::region::{Region, RegionId};
use crate::store::{SessionAttributes, SessionDelta};

/// Answer kept for resubmits of the last confirmed uplink
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationCache {
    pub fcnt_up: u32,
    /// PHY payload sent the first time, if any was sent
    pub downlink: Option<CachedDownlink>,
    pub resubmits: u32,
}

/// Downlink as first sent; timing is recomputed per resubmit
#[derive(Debug, Clone, PartialEq)]
pub struct CachedDownlink {
    pub payload: Vec<u8>,
    pub fcnt_down: u32,
}

/// In-memory session of one device
#[derive(Debug, Clone)]
pub struct DeviceSession {
    pub dev_eui: EUI64,
    pub dev_addr: DevAddr,
    pub nwk_skey: AESKey,
    pub app_skey: AESKey,
    pub application_id: Option<String>,
    pub gateway_id: Option<String>,
    fcnt_up: u32,
    fcnt_down: u32,
    fcnt_up_start: u32,
    fcnt_down_start: u32,
    fcnt_reset_desired: Option<u32>,
    fcnt_reset_reported: Option<u32>,
    pub supports_32bit_fcnt: bool,
    pub abp_relaxed: bool,
    pub preferred_window: u8,
    pub rx_delay: u8,
    pub rx1_dr_offset: u8,
    pub rx2_data_rate: Option<u8>,
    pub region: RegionId,
    pub downlink_enabled: bool,
    pub keep_alive_timeout: Option<Duration>,
    pub dev_nonce: Option<u16>,
    adr: Option<AdrSettings>,
    pub adr_history: AdrHistory,
    /// Values last written to the device store
    saved: Saved,
    /// True once an uplink was accepted in this process
    uplink_seen: bool,
    pub confirmation: Option<ConfirmationCache>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Saved {
    fcnt_up: u32,
    fcnt_down: u32,
    fcnt_up_start: u32,
    fcnt_down_start: u32,
    fcnt_reset_reported: Option<u32>,
    adr: Option<AdrSettings>,
}

impl DeviceSession {
    /// Build from stored attributes, applying a reset the operator requested
    /// since the last one honored
    pub fn from_attributes(attrs: SessionAttributes, config: &ServerConfig) -> Self {
        let adr = match (attrs.data_rate, attrs.tx_power, attrs.nb_rep) {
            (Some(data_rate), Some(tx_power), nb_rep) => Some(AdrSettings {
                data_rate,
                tx_power,
                nb_rep: nb_rep.unwrap_or(1),
            }),
            _ => None,
        };
        let saved = Saved {
            fcnt_up: attrs.fcnt_up,
            fcnt_down: attrs.fcnt_down,
            fcnt_up_start: attrs.fcnt_up_start,
            fcnt_down_start: attrs.fcnt_down_start,
            fcnt_reset_reported: attrs.fcnt_reset_reported,
            adr,
        };
        let mut session = Self {
            dev_eui: attrs.dev_eui,
            dev_addr: attrs.dev_addr,
            nwk_skey: attrs.nwk_skey,
            app_skey: attrs.app_skey,
            application_id: attrs.application_id,
            gateway_id: attrs.gateway_id,
            fcnt_up: attrs.fcnt_up,
            fcnt_down: attrs.fcnt_down,
            fcnt_up_start: attrs.fcnt_up_start,
            fcnt_down_start: attrs.fcnt_down_start,
            fcnt_reset_desired: attrs.fcnt_reset_desired,
            fcnt_reset_reported: attrs.fcnt_reset_reported,
            supports_32bit_fcnt: attrs.supports_32bit_fcnt,
            abp_relaxed: attrs.abp_relaxed,
            preferred_window: attrs.preferred_window,
            rx_delay: attrs.rx_delay,
            rx1_dr_offset: attrs.rx1_dr_offset,
            rx2_data_rate: attrs.rx2_data_rate,
            region: attrs.region.unwrap_or(config.default_region),
            downlink_enabled: attrs.downlink_enabled,
            keep_alive_timeout: attrs.keep_alive_timeout,
            dev_nonce: attrs.dev_nonce,
            adr,
            adr_history: AdrHistory::new(config.adr.history_size),
            saved,
            uplink_seen: false,
            confirmation: None,
        };

        if attrs.fcnt_reset_desired.is_some()
            && fcnt::generation_allows_reset(attrs.fcnt_reset_desired, attrs.fcnt_reset_reported)
        {
            debug!(
                dev_eui = %session.dev_eui,
                generation = ?attrs.fcnt_reset_desired,
                "applying pending frame counter reset"
            );
            session.fcnt_up = attrs.fcnt_up_start;
            session.fcnt_down = attrs.fcnt_down_start;
            session.fcnt_reset_reported = attrs.fcnt_reset_desired;
        }
        session
    }

    /// Current attributes as the device store would hold them
    pub fn to_attributes(&self) -> SessionAttributes {
        SessionAttributes {
            dev_eui: self.dev_eui,
            dev_addr: self.dev_addr,
            nwk_skey: self.nwk_skey,
            app_skey: self.app_skey,
            application_id: self.application_id.clone(),
            gateway_id: self.gateway_id.clone(),
            fcnt_up: self.fcnt_up,
            fcnt_down: self.fcnt_down,
            fcnt_up_start: self.fcnt_up_start,
            fcnt_down_start: self.fcnt_down_start,
            fcnt_reset_desired: self.fcnt_reset_desired,
            fcnt_reset_reported: self.fcnt_reset_reported,
            supports_32bit_fcnt: self.supports_32bit_fcnt,
            abp_relaxed: self.abp_relaxed,
            preferred_window: self.preferred_window,
            rx_delay: self.rx_delay,
            rx1_dr_offset: self.rx1_dr_offset,
            rx2_data_rate: self.rx2_data_rate,
            region: Some(self.region),
            downlink_enabled: self.downlink_enabled,
            keep_alive_timeout: self.keep_alive_timeout,
            data_rate: self.adr.map(|a| a.data_rate),
            tx_power: self.adr.map(|a| a.tx_power),
            nb_rep: self.adr.map(|a| a.nb_rep),
            dev_nonce: self.dev_nonce,
        }
    }

    pub fn region_plan(&self) -> &'static dyn Region {
        self.region.plan()
    }

    pub fn timing(&self) -> TimingParams {
        TimingParams::with_rx_delay(self.rx_delay)
    }

    pub fn fcnt_up(&self) -> u32 {
        self.fcnt_up
    }

    /// Next downlink counter to issue
    pub fn fcnt_down(&self) -> u32 {
        self.fcnt_down
    }

    pub fn fcnt_up_start(&self) -> u32 {
        self.fcnt_up_start
    }

    pub fn fcnt_down_start(&self) -> u32 {
        self.fcnt_down_start
    }

    pub fn fcnt_reset_reported(&self) -> Option<u32> {
        self.fcnt_reset_reported
    }

    pub fn fcnt_reset_desired(&self) -> Option<u32> {
        self.fcnt_reset_desired
    }

    /// Whether a relaxed restart of the counter may be honored now
    pub fn reset_allowed(&self) -> bool {
        self.abp_relaxed
            && fcnt::generation_allows_reset(self.fcnt_reset_desired, self.fcnt_reset_reported)
    }

    /// Counter state for validating the next uplink
    pub fn fcnt_state(&self, max_gap: u32) -> FcntState {
        FcntState {
            last: self.fcnt_up,
            fresh: !self.uplink_seen && self.fcnt_up == 0 && self.fcnt_down == 0,
            uplink_seen: self.uplink_seen,
            supports_32bit: self.supports_32bit_fcnt,
            reset_allowed: self.reset_allowed(),
            max_gap,
        }
    }

    /// Record a new uplink counter
    pub fn accept_fcnt_up(&mut self, counter: u32) {
        self.fcnt_up = counter;
        self.uplink_seen = true;
        self.confirmation = None;
    }

    /// Honor a counter restart: both counters restart and the generation is consumed
    pub fn apply_reset(&mut self, counter: u32) {
        self.fcnt_up = counter;
        self.fcnt_down = 0;
        self.fcnt_up_start = counter;
        self.fcnt_down_start = 0;
        self.fcnt_reset_reported = self.fcnt_reset_desired;
        self.uplink_seen = true;
        self.confirmation = None;
        self.adr_history.clear();
    }

    /// Take the next downlink counter locally
    pub fn issue_fcnt_down(&mut self) -> u32 {
        let next = self.fcnt_down;
        self.fcnt_down = self.fcnt_down.wrapping_add(1);
        next
    }

    /// Adopt a downlink counter allocated elsewhere
    pub fn adopt_fcnt_down(&mut self, allocated: u32) {
        self.fcnt_down = allocated.wrapping_add(1);
    }

    /// Settings the device transmits with: the commanded ones once its
    /// uplinks use the commanded data rate, the defaults before that
    pub fn adr_settings(&self, uplink_data_rate: u8) -> AdrSettings {
        match self.adr {
            Some(settings) if settings.data_rate == uplink_data_rate => settings,
            _ => AdrSettings {
                data_rate: uplink_data_rate,
                tx_power: 0,
                nb_rep: 1,
            },
        }
    }

    pub fn commanded_adr(&self) -> Option<AdrSettings> {
        self.adr
    }

    pub fn set_adr(&mut self, settings: AdrSettings) {
        self.adr = Some(settings);
    }

    /// Unsaved changes exist
    pub fn is_dirty(&self) -> bool {
        !self.delta().is_empty()
    }

    /// Whether either counter moved `threshold` or more since the last write.
    ///
    /// A delta equal to `fcnt_save_delta` already forces the write, so at
    /// most `threshold - 1` counter values are lost on a restart.
    pub fn reaches_save_delta(&self, threshold: u32) -> bool {
        self.fcnt_up.abs_diff(self.saved.fcnt_up) >= threshold
            || self.fcnt_down.abs_diff(self.saved.fcnt_down) >= threshold
    }

    /// Fields that differ from the last write
    pub fn delta(&self) -> SessionDelta {
        fn changed<T: PartialEq + Copy>(now: T, saved: T) -> Option<T> {
            (now != saved).then_some(now)
        }
        let mut delta = SessionDelta {
            fcnt_up: changed(self.fcnt_up, self.saved.fcnt_up),
            fcnt_down: changed(self.fcnt_down, self.saved.fcnt_down),
            fcnt_up_start: changed(self.fcnt_up_start, self.saved.fcnt_up_start),
            fcnt_down_start: changed(self.fcnt_down_start, self.saved.fcnt_down_start),
            ..SessionDelta::default()
        };
        if self.fcnt_reset_reported != self.saved.fcnt_reset_reported {
            delta.fcnt_reset_reported = self.fcnt_reset_reported;
        }
        if self.adr != self.saved.adr {
            if let Some(adr) = self.adr {
                delta.data_rate = Some(adr.data_rate);
                delta.tx_power = Some(adr.tx_power);
                delta.nb_rep = Some(adr.nb_rep);
            }
        }
        delta
    }

    /// Everything in `delta` reached the device store
    pub fn mark_persisted(&mut self, delta: &SessionDelta) {
        if let Some(v) = delta.fcnt_up {
            self.saved.fcnt_up = v;
        }
        if let Some(v) = delta.fcnt_down {
            self.saved.fcnt_down = v;
        }
        if let Some(v) = delta.fcnt_up_start {
            self.saved.fcnt_up_start = v;
        }
        if let Some(v) = delta.fcnt_down_start {
            self.saved.fcnt_down_start = v;
        }
        if delta.fcnt_reset_reported.is_some() {
            self.saved.fcnt_reset_reported = delta.fcnt_reset_reported;
        }
        if let (Some(data_rate), Some(tx_power), Some(nb_rep)) =
            (delta.data_rate, delta.tx_power, delta.nb_rep)
        {
            self.saved.adr = Some(AdrSettings {
                data_rate,
                tx_power,
                nb_rep,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs() -> SessionAttributes {
        SessionAttributes::new(
            EUI64::new([1; 8]),
            DevAddr::from_u32(0x2600_0001),
            AESKey::new([2; 16]),
            AESKey::new([3; 16]),
        )
    }

    #[test]
    fn loaded_session_is_clean() {
        let mut a = attrs();
        a.fcnt_up = 40;
        a.fcnt_down = 7;
        let session = DeviceSession::from_attributes(a, &ServerConfig::default());
        assert!(!session.is_dirty());
        assert_eq!(session.fcnt_up(), 40);
        assert_eq!(session.fcnt_down(), 7);
    }

    #[test]
    fn pending_reset_applies_on_load() {
        let mut a = attrs();
        a.fcnt_up = 40;
        a.fcnt_down = 7;
        a.fcnt_up_start = 5;
        a.fcnt_reset_desired = Some(2);
        a.fcnt_reset_reported = Some(1);
        let session = DeviceSession::from_attributes(a, &ServerConfig::default());
        assert_eq!(session.fcnt_up(), 5);
        assert_eq!(session.fcnt_down(), 0);
        assert_eq!(session.fcnt_reset_reported(), Some(2));
        let delta = session.delta();
        assert_eq!(delta.fcnt_up, Some(5));
        assert_eq!(delta.fcnt_reset_reported, Some(2));
    }

    #[test]
    fn delta_tracks_unsaved_counters() {
        let mut session = DeviceSession::from_attributes(attrs(), &ServerConfig::default());
        session.accept_fcnt_up(3);
        assert_eq!(session.issue_fcnt_down(), 0);
        assert!(session.is_dirty());
        assert!(!session.reaches_save_delta(10));
        assert!(session.reaches_save_delta(3));
        assert!(!session.reaches_save_delta(4));

        let delta = session.delta();
        assert_eq!(delta.fcnt_up, Some(3));
        assert_eq!(delta.fcnt_down, Some(1));
        session.mark_persisted(&delta);
        assert!(!session.is_dirty());
    }
}
