//! Uplink state machine for data frames
//!
//! One request moves through `Authenticating -> FrameCounterCheck ->
//! Processing` and ends `Committed` or `Rejected`. The device's session lock
//! is held for the whole run, so uplinks of one device never interleave.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::downlink::{window_params, CloudFit, DownlinkBuilder, DownlinkFrame};
use super::fcnt_strategy::FrameCounterStrategies;
use super::{StageTracker, UplinkFailure, UplinkStage};
use crate::class::class_a::{ReceiveWindow, WindowTimer};
use crate::config::device::EUI64;
use crate::config::ServerConfig;
use crate::crypto::Direction;
use crate::device::adr;
use crate::device::fcnt::{self, FcntDecision};
use crate::device::session::{CachedDownlink, ConfirmationCache};
use crate::device::{DeviceSession, LoRaDevice};
use crate::error::FailureReason;
use crate::lorawan::commands::{self, MacCommand};
use crate::lorawan::mac::DataFrame;
use crate::lorawan::phy::RadioMetadata;
use crate::lorawan::region::Region;
use crate::store::{CloudMessage, CloudMessageQueue, DeviceStore, SessionDelta, Telemetry, TelemetrySink};

const GPS_EPOCH_UNIX_SECS: u64 = 315_964_800;
/// GPS time runs ahead of UTC by the leap seconds since 1980
const GPS_LEAP_SECONDS: u64 = 18;

/// A data frame as received
#[derive(Debug, Clone, Copy)]
pub struct DataUplink<'a> {
    pub frame: &'a DataFrame,
    pub metadata: &'a RadioMetadata,
    pub arrival: Instant,
}

pub struct DataMessageHandler {
    config: Arc<ServerConfig>,
    store: Arc<dyn DeviceStore>,
    cloud: Arc<dyn CloudMessageQueue>,
    telemetry: Arc<dyn TelemetrySink>,
    strategies: FrameCounterStrategies,
}

impl DataMessageHandler {
    pub fn new(
        config: Arc<ServerConfig>,
        store: Arc<dyn DeviceStore>,
        cloud: Arc<dyn CloudMessageQueue>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let strategies = FrameCounterStrategies::new(store.clone(), config.gateway_id.clone());
        Self {
            config,
            store,
            cloud,
            telemetry,
            strategies,
        }
    }

    /// Run one uplink through the device's state machine
    pub async fn handle(
        &self,
        device: &LoRaDevice,
        uplink: DataUplink<'_>,
    ) -> Result<Option<DownlinkFrame>, UplinkFailure> {
        let mut tracker = StageTracker::new(device.dev_eui());
        let mut guard = device.lock().await;
        let session = &mut *guard;
        let frame = uplink.frame;
        let dev_eui = session.dev_eui;

        tracker.enter(UplinkStage::Authenticating);
        if let Some(owner) = session.gateway_id.as_deref() {
            if owner != self.config.gateway_id {
                debug!(%dev_eui, owner, "device belongs to another gateway");
                return Err(tracker.fail(FailureReason::BelongsToAnotherGateway));
            }
        }

        let confirmed = frame.mtype.is_confirmed();
        let decision = fcnt::evaluate(
            &session.fcnt_state(self.config.max_fcnt_gap),
            frame.fhdr.f_cnt,
            confirmed,
        );
        let counter = decision.counter();
        if !frame.verify_mic(&session.nwk_skey, counter) {
            warn!(%dev_eui, fcnt = counter, "MIC check failed");
            return Err(tracker.fail(FailureReason::AuthenticationFailed));
        }
        if session.region_plan().uplink_index(uplink.metadata.data_rate).is_none() {
            warn!(%dev_eui, data_rate = %uplink.metadata.data_rate, region = %session.region, "data rate not in region");
            return Err(tracker.fail(FailureReason::InvalidFrame));
        }

        // decode before any state changes so a bad frame leaves no trace
        let mac_in_payload = frame.f_port == Some(0);
        let mac_bytes = if mac_in_payload {
            frame.decrypt_payload(&session.nwk_skey, &session.app_skey, counter)
        } else {
            frame.fhdr.f_opts.to_vec()
        };
        let requests = commands::decode(&mac_bytes, Direction::Up).map_err(|err| {
            warn!(%dev_eui, fcnt = counter, error = %err, "malformed MAC commands, frame dropped");
            tracker.fail(FailureReason::MalformedMacCommands)
        })?;

        tracker.enter(UplinkStage::FrameCounterCheck);
        let fcnt_down_before = session.fcnt_down();
        let outcome = match decision {
            FcntDecision::Invalid(c) => {
                debug!(%dev_eui, fcnt = c, last = session.fcnt_up(), "frame counter rejected");
                return Err(tracker.fail(FailureReason::InvalidFrameCounter));
            }
            FcntDecision::Resubmit(c) => {
                tracker.enter(UplinkStage::Processing);
                self.resubmit(session, uplink, c).await
            }
            FcntDecision::Reset(c) => {
                self.reset(session, c).await.map_err(|r| tracker.fail(r))?;
                device.update_fcnt_hint(session.fcnt_up());
                tracker.enter(UplinkStage::Processing);
                self.process(session, uplink, requests, counter, mac_in_payload)
                    .await
            }
            FcntDecision::Accept(c) => {
                session.accept_fcnt_up(c);
                device.update_fcnt_hint(c);
                tracker.enter(UplinkStage::Processing);
                self.process(session, uplink, requests, counter, mac_in_payload)
                    .await
            }
        };

        let allocated_remotely = session.fcnt_down() != fcnt_down_before
            && self.strategies.for_session(session).persists_allocation();
        // a reset applied at load time is written with the first uplink
        let pending_reset = session.delta().fcnt_reset_reported.is_some();
        self.persist(session, allocated_remotely || pending_reset).await;

        match outcome {
            Ok(downlink) => {
                tracker.enter(UplinkStage::Committed);
                Ok(downlink)
            }
            Err(reason) => Err(tracker.fail(reason)),
        }
    }

    /// Honor a counter restart; the write must succeed before anything else
    async fn reset(&self, session: &mut DeviceSession, counter: u32) -> Result<(), FailureReason> {
        let before = session.clone();
        session.apply_reset(counter);
        let delta = SessionDelta {
            fcnt_up: Some(session.fcnt_up()),
            fcnt_down: Some(session.fcnt_down()),
            fcnt_up_start: Some(session.fcnt_up_start()),
            fcnt_down_start: Some(session.fcnt_down_start()),
            ..session.delta()
        };
        if let Err(err) = self
            .store
            .persist_session_delta(session.dev_eui, delta.clone())
            .await
        {
            warn!(dev_eui = %session.dev_eui, error = %err, "frame counter reset not persisted");
            *session = before;
            return Err(FailureReason::BackendUnavailable);
        }
        session.mark_persisted(&delta);
        info!(
            dev_eui = %session.dev_eui,
            fcnt = counter,
            generation = ?session.fcnt_reset_reported(),
            "frame counter reset"
        );

        if let Err(err) = self.strategies.for_session(session).on_reset(session).await {
            warn!(dev_eui = %session.dev_eui, error = %err, "frame counter cache reset failed");
        }
        Ok(())
    }

    async fn process(
        &self,
        session: &mut DeviceSession,
        uplink: DataUplink<'_>,
        requests: Vec<MacCommand>,
        counter: u32,
        mac_in_payload: bool,
    ) -> Result<Option<DownlinkFrame>, FailureReason> {
        let frame = uplink.frame;
        let metadata = uplink.metadata;
        let region = session.region_plan();
        let confirmed = frame.mtype.is_confirmed();

        let mut mac = Vec::new();
        for request in &requests {
            if let Some(answer) = answer(session.dev_eui, request, metadata) {
                mac.push(answer);
            }
        }
        if frame.fhdr.f_ctrl.adr {
            if let Some(request) = self.adr(session, region, counter, metadata, frame.fhdr.f_ctrl.adr_ack_req) {
                mac.push(request);
            }
        }

        if let Some(f_port) = frame.f_port.filter(|port| *port != 0) {
            let telemetry = Telemetry {
                dev_eui: session.dev_eui,
                dev_addr: session.dev_addr,
                fcnt: counter,
                f_port: Some(f_port),
                payload: frame.decrypt_payload(&session.nwk_skey, &session.app_skey, counter),
                confirmed,
                metadata: metadata.clone(),
            };
            if let Err(err) = self.telemetry.send(telemetry).await {
                warn!(dev_eui = %session.dev_eui, fcnt = counter, error = %err, "telemetry not forwarded");
            }
        }

        if confirmed {
            session.confirmation = Some(ConfirmationCache {
                fcnt_up: counter,
                downlink: None,
                resubmits: 0,
            });
        }

        let timer = WindowTimer::new(uplink.arrival, &session.timing(), &self.config);
        self.downlink(session, uplink, &timer, counter, mac, mac_in_payload)
            .await
    }

    /// Feed the ADR loop; returns a LinkADRReq when the settings change
    fn adr(
        &self,
        session: &mut DeviceSession,
        region: &dyn Region,
        counter: u32,
        metadata: &RadioMetadata,
        adr_ack_req: bool,
    ) -> Option<MacCommand> {
        let uplink_dr = region.uplink_index(metadata.data_rate)?;
        session.adr_history.record(counter, metadata.snr, uplink_dr);
        let current = session.adr_settings(uplink_dr);
        let next = adr::compute(
            region,
            &self.config.adr,
            &session.adr_history,
            current,
            adr_ack_req,
        )?;
        if !adr_ack_req && (next == current || session.commanded_adr() == Some(next)) {
            return None;
        }

        info!(
            dev_eui = %session.dev_eui,
            data_rate = next.data_rate,
            tx_power = next.tx_power,
            nb_rep = next.nb_rep,
            "ADR change"
        );
        session.set_adr(next);
        let (ch_mask, ch_mask_cntl) = region.adr_channel_mask();
        Some(MacCommand::LinkADRReq {
            data_rate: next.data_rate,
            tx_power: next.tx_power,
            ch_mask,
            ch_mask_cntl,
            nb_trans: next.nb_rep,
        })
    }

    async fn downlink(
        &self,
        session: &mut DeviceSession,
        uplink: DataUplink<'_>,
        timer: &WindowTimer,
        fcnt_up: u32,
        mac: Vec<MacCommand>,
        mac_in_payload: bool,
    ) -> Result<Option<DownlinkFrame>, FailureReason> {
        let dev_eui = session.dev_eui;
        let confirmed = uplink.frame.mtype.is_confirmed();
        let preferred = session.preferred_window;

        if timer.resolve_window_to_use(preferred).is_none() {
            debug!(%dev_eui, elapsed_ms = timer.elapsed().as_millis() as u64, "receive windows missed");
            return missed(confirmed);
        }

        let mut message = None;
        let mut more_pending = false;
        if session.downlink_enabled {
            message = self.fetch_cloud_message(dev_eui, timer, preferred).await;
            if message.is_some() {
                more_pending = self.peek_next(dev_eui, timer, preferred).await;
            }
        }
        if !confirmed && mac.is_empty() && message.is_none() {
            return Ok(None);
        }

        let strategy = self.strategies.for_session(session);
        let fcnt_down = match timer.race(strategy.next_fcnt_down(session, fcnt_up)).await {
            Some(Ok(Some(fcnt_down))) => fcnt_down,
            Some(Ok(None)) => {
                self.abandon(dev_eui, message).await;
                return Err(FailureReason::HandledByAnotherGateway);
            }
            Some(Err(err)) => {
                warn!(%dev_eui, error = %err, "downlink counter allocation failed");
                self.abandon(dev_eui, message).await;
                return Err(FailureReason::BackendUnavailable);
            }
            None => {
                self.abandon(dev_eui, message).await;
                return missed(confirmed);
            }
        };

        let Some(window) = timer.resolve_window_to_use(preferred) else {
            debug!(%dev_eui, fcnt_down, "receive windows missed while preparing the downlink");
            self.abandon(dev_eui, message).await;
            return missed(confirmed);
        };
        let region = session.region_plan();
        let Some((params, max_payload)) = window_params(
            region,
            window,
            uplink.metadata,
            session.rx1_dr_offset,
            session.rx2_data_rate,
        )
        .and_then(|p| Some((p, region.max_payload_size(p.data_rate_index)?))) else {
            warn!(%dev_eui, ?window, "no downlink parameters for window");
            self.abandon(dev_eui, message).await;
            return Err(FailureReason::InvalidFrame);
        };

        let mut builder =
            DownlinkBuilder::new(max_payload, mac_in_payload, confirmed, uplink.frame.fhdr.f_ctrl.adr);
        for command in mac {
            builder.add_mac(command);
        }
        let mut committed = None;
        if let Some(message) = message {
            match builder.offer_cloud(&message) {
                CloudFit::Fits => committed = Some(message),
                CloudFit::Blocked => {
                    debug!(%dev_eui, message_id = %message.id, "port 0 carries MAC answers, cloud message deferred");
                    self.abandon(dev_eui, Some(message)).await;
                }
                CloudFit::ReservedPort => {
                    warn!(%dev_eui, message_id = %message.id, f_port = message.f_port, "cloud message uses a reserved port");
                    self.reject(dev_eui, &message).await;
                }
                CloudFit::TooLarge if can_retry(&message, timer) => {
                    info!(%dev_eui, message_id = %message.id, size = message.size(), max_payload, "cloud message too large, retrying later");
                    self.abandon(dev_eui, Some(message)).await;
                }
                CloudFit::TooLarge => {
                    warn!(%dev_eui, message_id = %message.id, size = message.size(), max_payload, "cloud message too large and expiring");
                    self.reject(dev_eui, &message).await;
                }
            }
        }
        builder.set_f_pending(committed.is_some() && more_pending);
        if builder.is_empty() && !confirmed {
            return Ok(None);
        }

        let payload = match builder.build(session.dev_addr, &session.nwk_skey, &session.app_skey, fcnt_down) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%dev_eui, error = %err, "downlink could not be encoded");
                self.abandon(dev_eui, committed).await;
                return Err(FailureReason::InvalidFrame);
            }
        };
        if let Some(message) = &committed {
            match self.cloud.complete(dev_eui, message).await {
                Ok(()) => info!(%dev_eui, message_id = %message.id, fcnt_down, "cloud message sent"),
                Err(err) => warn!(%dev_eui, message_id = %message.id, error = %err, "cloud message not completed"),
            }
        }

        if confirmed {
            session.confirmation = Some(ConfirmationCache {
                fcnt_up,
                downlink: Some(CachedDownlink {
                    payload: payload.clone(),
                    fcnt_down,
                }),
                resubmits: 0,
            });
        }
        debug!(%dev_eui, ?window, fcnt_down, size = payload.len(), "downlink ready");
        Ok(Some(DownlinkFrame::new(
            payload,
            window,
            timer,
            params,
            uplink.metadata,
            Some(fcnt_down),
        )))
    }

    /// Answer a repeated confirmed uplink with the downlink sent the first time
    async fn resubmit(
        &self,
        session: &mut DeviceSession,
        uplink: DataUplink<'_>,
        counter: u32,
    ) -> Result<Option<DownlinkFrame>, FailureReason> {
        let dev_eui = session.dev_eui;
        if session
            .confirmation
            .as_ref()
            .is_some_and(|cache| cache.fcnt_up != counter)
        {
            session.confirmation = None;
        }
        let cache = session.confirmation.get_or_insert_with(|| ConfirmationCache {
            fcnt_up: counter,
            downlink: None,
            resubmits: 0,
        });
        cache.resubmits += 1;
        let resubmits = cache.resubmits;
        let cached = cache.downlink.clone();
        if resubmits > self.config.max_confirmation_resubmits {
            warn!(%dev_eui, fcnt = counter, resubmits, "resubmit threshold exceeded");
            return Err(FailureReason::ConfirmationResubmitThresholdExceeded);
        }

        let timer = WindowTimer::new(uplink.arrival, &session.timing(), &self.config);
        let Some(window) = timer.resolve_window_to_use(session.preferred_window) else {
            return Err(FailureReason::ReceiveWindowMissed);
        };
        let region = session.region_plan();
        let params = window_params(
            region,
            window,
            uplink.metadata,
            session.rx1_dr_offset,
            session.rx2_data_rate,
        )
        .ok_or(FailureReason::InvalidFrame)?;

        let CachedDownlink { payload, fcnt_down } = match cached {
            Some(cached) => cached,
            None => {
                // the first answer never went out: acknowledge now
                let strategy = self.strategies.for_session(session);
                let fcnt_down = match timer.race(strategy.next_fcnt_down(session, counter)).await {
                    Some(Ok(Some(fcnt_down))) => fcnt_down,
                    Some(Ok(None)) => return Err(FailureReason::HandledByAnotherGateway),
                    Some(Err(_)) => return Err(FailureReason::BackendUnavailable),
                    None => return Err(FailureReason::ReceiveWindowMissed),
                };
                let max_payload = region
                    .max_payload_size(params.data_rate_index)
                    .ok_or(FailureReason::InvalidFrame)?;
                let payload = DownlinkBuilder::new(max_payload, false, true, uplink.frame.fhdr.f_ctrl.adr)
                    .build(session.dev_addr, &session.nwk_skey, &session.app_skey, fcnt_down)?;
                let cached = CachedDownlink { payload, fcnt_down };
                if let Some(cache) = &mut session.confirmation {
                    cache.downlink = Some(cached.clone());
                }
                cached
            }
        };

        info!(%dev_eui, fcnt = counter, resubmits, ?window, "answering resubmitted uplink");
        Ok(Some(DownlinkFrame::new(
            payload,
            window,
            &timer,
            params,
            uplink.metadata,
            Some(fcnt_down),
        )))
    }

    async fn fetch_cloud_message(
        &self,
        dev_eui: EUI64,
        timer: &WindowTimer,
        preferred: u8,
    ) -> Option<CloudMessage> {
        let budget = timer.available_time_to_check_cloud_message(preferred);
        if budget.is_zero() {
            debug!(%dev_eui, "no time left to check for cloud messages");
            return None;
        }
        match timer.race(self.cloud.receive(dev_eui, budget)).await {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                warn!(%dev_eui, error = %err, "cloud message lookup failed");
                None
            }
            None => {
                debug!(%dev_eui, "cloud message lookup overran the receive windows");
                None
            }
        }
    }

    /// Whether another message waits after the current one; it stays queued
    async fn peek_next(&self, dev_eui: EUI64, timer: &WindowTimer, preferred: u8) -> bool {
        if timer.available_time_to_check_cloud_message(preferred).is_zero() {
            return false;
        }
        match timer.race(self.cloud.receive(dev_eui, Duration::ZERO)).await {
            Some(Ok(Some(next))) => {
                self.abandon(dev_eui, Some(next)).await;
                true
            }
            _ => false,
        }
    }

    async fn abandon(&self, dev_eui: EUI64, message: Option<CloudMessage>) {
        if let Some(message) = message {
            if let Err(err) = self.cloud.abandon(dev_eui, &message).await {
                warn!(%dev_eui, message_id = %message.id, error = %err, "cloud message not abandoned");
            }
        }
    }

    async fn reject(&self, dev_eui: EUI64, message: &CloudMessage) {
        if let Err(err) = self.cloud.reject(dev_eui, message).await {
            warn!(%dev_eui, message_id = %message.id, error = %err, "cloud message not rejected");
        }
    }

    /// Write the unsaved delta when forced or when it grew past the threshold.
    /// A failed write leaves the session dirty for the next attempt.
    async fn persist(&self, session: &mut DeviceSession, forced: bool) {
        if !forced && !session.reaches_save_delta(self.config.fcnt_save_delta) {
            return;
        }
        let delta = session.delta();
        if delta.is_empty() {
            return;
        }
        match self
            .store
            .persist_session_delta(session.dev_eui, delta.clone())
            .await
        {
            Ok(()) => {
                session.mark_persisted(&delta);
                debug!(dev_eui = %session.dev_eui, fcnt_up = session.fcnt_up(), fcnt_down = session.fcnt_down(), "session saved");
            }
            Err(err) => {
                warn!(dev_eui = %session.dev_eui, error = %err, "session save failed, will retry");
            }
        }
    }
}

fn missed(confirmed: bool) -> Result<Option<DownlinkFrame>, FailureReason> {
    if confirmed {
        Err(FailureReason::ReceiveWindowMissed)
    } else {
        Ok(None)
    }
}

/// A message that did not fit may wait for a later cycle only if it outlives this one
fn can_retry(message: &CloudMessage, timer: &WindowTimer) -> bool {
    let cycle_end = timer.arrival() + timer.delay(ReceiveWindow::Rx2);
    message.expires_at.map_or(true, |expires_at| expires_at > cycle_end)
}

/// Network answer to a device request; `None` for device answers
fn answer(dev_eui: EUI64, command: &MacCommand, metadata: &RadioMetadata) -> Option<MacCommand> {
    match command {
        MacCommand::LinkCheckReq => {
            let margin = (metadata.snr - metadata.data_rate.required_snr()).clamp(0.0, 254.0);
            Some(MacCommand::LinkCheckAns {
                margin: margin as u8,
                gateway_count: 1,
            })
        }
        MacCommand::DeviceTimeReq => Some(device_time(SystemTime::now())),
        MacCommand::LinkADRAns {
            power_ack,
            data_rate_ack,
            channel_mask_ack,
        } => {
            if *power_ack && *data_rate_ack && *channel_mask_ack {
                debug!(%dev_eui, "LinkADRReq accepted");
            } else {
                warn!(%dev_eui, power_ack, data_rate_ack, channel_mask_ack, "LinkADRReq refused");
            }
            None
        }
        MacCommand::DevStatusAns { battery, margin } => {
            info!(%dev_eui, battery, margin, "device status");
            None
        }
        other => {
            debug!(%dev_eui, cid = ?other.cid(), "MAC answer received");
            None
        }
    }
}

/// DeviceTimeAns for `now`: GPS seconds and 1/256 s fractions
pub fn device_time(now: SystemTime) -> MacCommand {
    let since_unix = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let gps = since_unix.saturating_sub(Duration::from_secs(GPS_EPOCH_UNIX_SECS))
        + Duration::from_secs(GPS_LEAP_SECONDS);
    MacCommand::DeviceTimeAns {
        seconds: gps.as_secs() as u32,
        fraction: (u64::from(gps.subsec_nanos()) * 256 / 1_000_000_000) as u8,
    }
}
