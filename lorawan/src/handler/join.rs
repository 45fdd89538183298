//! OTAA joins
//!
//! A join creates a brand-new session. The device store must hold the new
//! keys and zeroed counters before the join accept is handed out, otherwise a
//! restart could leave the device with keys the network forgot.

use std::sync::Arc;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::downlink::{window_params, DownlinkFrame};
use super::{StageTracker, UplinkFailure, UplinkStage};
use crate::class::class_a::WindowTimer;
use crate::config::device::{DevAddr, NetId};
use crate::config::ServerConfig;
use crate::crypto;
use crate::error::FailureReason;
use crate::lorawan::mac::{JoinAccept, JoinRequest};
use crate::lorawan::phy::{RadioMetadata, TimingParams};
use crate::registry::Registry;
use crate::store::{DeviceStore, SessionAttributes, SessionDelta};

/// Bits of a type-0 DevAddr below the NwkID
const NWK_ADDR_MASK: u32 = 0x01FF_FFFF;

pub struct JoinRequestHandler {
    config: Arc<ServerConfig>,
    store: Arc<dyn DeviceStore>,
    registry: Registry,
}

impl JoinRequestHandler {
    pub fn new(config: Arc<ServerConfig>, store: Arc<dyn DeviceStore>, registry: Registry) -> Self {
        Self {
            config,
            store,
            registry,
        }
    }

    /// Validate a join request and produce the join accept
    pub async fn handle(
        &self,
        request: &JoinRequest,
        metadata: &RadioMetadata,
        arrival: Instant,
    ) -> Result<DownlinkFrame, UplinkFailure> {
        let dev_eui = request.dev_eui;
        let mut tracker = StageTracker::new(dev_eui);

        tracker.enter(UplinkStage::Authenticating);
        let info = match self.store.fetch_join_info(dev_eui).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                debug!(%dev_eui, "join from unknown device");
                return Err(tracker.fail(FailureReason::UnknownDevice));
            }
            Err(err) => {
                warn!(%dev_eui, error = %err, "join info lookup failed");
                return Err(tracker.fail(FailureReason::BackendUnavailable));
            }
        };
        if let Some(owner) = info.gateway_id.as_deref() {
            if owner != self.config.gateway_id {
                debug!(%dev_eui, owner, "join for a device of another gateway");
                return Err(tracker.fail(FailureReason::BelongsToAnotherGateway));
            }
        }
        if info.join_eui != request.join_eui || !request.verify_mic(&info.app_key) {
            warn!(%dev_eui, join_eui = %request.join_eui, "join request failed authentication");
            return Err(tracker.fail(FailureReason::AuthenticationFailed));
        }

        tracker.enter(UplinkStage::FrameCounterCheck);
        if info.last_dev_nonce == Some(request.dev_nonce) {
            warn!(%dev_eui, dev_nonce = request.dev_nonce, "DevNonce reused");
            return Err(tracker.fail(FailureReason::JoinDevNonceReused));
        }

        tracker.enter(UplinkStage::Processing);
        let timing = TimingParams::with_rx_delay(info.rx_delay);
        let timer = WindowTimer::for_join(arrival, &timing, &self.config);
        if timer.resolve_window_to_use(info.preferred_window).is_none() {
            debug!(%dev_eui, elapsed_ms = timer.elapsed().as_millis() as u64, "join windows missed before processing");
            return Err(tracker.fail(FailureReason::ReceiveWindowMissed));
        }

        let (app_nonce, dev_addr) = allocate_address(self.config.net_id);
        let (nwk_skey, app_skey) =
            crypto::derive_session_keys(&info.app_key, &app_nonce, self.config.net_id, request.dev_nonce);
        let mut attrs = SessionAttributes::new(dev_eui, dev_addr, nwk_skey, app_skey);
        attrs.application_id = info.application_id.clone();
        attrs.gateway_id = info.gateway_id.clone();
        attrs.region = info.region;
        attrs.preferred_window = info.preferred_window;
        attrs.rx_delay = info.rx_delay;
        attrs.rx1_dr_offset = info.rx1_dr_offset;
        attrs.rx2_data_rate = info.rx2_data_rate;
        attrs.supports_32bit_fcnt = info.supports_32bit_fcnt;
        attrs.downlink_enabled = info.downlink_enabled;
        attrs.keep_alive_timeout = info.keep_alive_timeout;
        attrs.dev_nonce = Some(request.dev_nonce);

        if let Err(err) = self
            .store
            .persist_session_delta(dev_eui, SessionDelta::full(&attrs))
            .await
        {
            warn!(%dev_eui, error = %err, "joined session not persisted");
            return Err(tracker.fail(FailureReason::BackendUnavailable));
        }
        let region = attrs.region.unwrap_or(self.config.default_region).plan();
        self.registry.get_or_create_for_join(attrs);

        let Some(window) = timer.resolve_window_to_use(info.preferred_window) else {
            debug!(%dev_eui, %dev_addr, "join windows missed after persisting");
            return Err(tracker.fail(FailureReason::ReceiveWindowMissed));
        };
        let Some(params) = window_params(region, window, metadata, info.rx1_dr_offset, info.rx2_data_rate)
        else {
            return Err(tracker.fail(FailureReason::InvalidFrame));
        };

        let accept = JoinAccept {
            app_nonce,
            net_id: self.config.net_id,
            dev_addr,
            rx1_dr_offset: info.rx1_dr_offset,
            rx2_data_rate: info.rx2_data_rate.unwrap_or(region.rx2_default().1),
            rx_delay: info.rx_delay,
        };
        info!(%dev_eui, %dev_addr, dev_nonce = request.dev_nonce, ?window, "join accepted");
        tracker.enter(UplinkStage::Committed);
        Ok(DownlinkFrame::new(
            accept.encode(&info.app_key),
            window,
            &timer,
            params,
            metadata,
            None,
        ))
    }
}

/// Random AppNonce and a DevAddr inside this network's NwkID
fn allocate_address(net_id: NetId) -> ([u8; 3], DevAddr) {
    let mut rng = rand::thread_rng();
    let app_nonce: [u8; 3] = rng.gen();
    let nwk_addr = rng.gen::<u32>() & NWK_ADDR_MASK;
    let dev_addr = DevAddr::from_u32((u32::from(net_id.nwk_id()) << 25) | nwk_addr);
    (app_nonce, dev_addr)
}
