//! Entry point for uplinks handed over by the packet forwarder
//!
//! The dispatcher decodes the PHY payload, filters foreign networks, resolves
//! the device through the [`Registry`] and runs the device's state machine.
//! Every failure comes back as an [`UplinkOutcome`]; nothing escapes as a
//! panic or an error past this point.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::FailureReason;
use crate::handler::{
    DataMessageHandler, DataUplink, DownlinkFrame, JoinRequestHandler, UplinkFailure,
};
use crate::lorawan::mac::{self, DataFrame, UplinkFrame};
use crate::lorawan::phy::RadioMetadata;
use crate::registry::Registry;
use crate::store::{CloudMessageQueue, DeviceStore, TelemetrySink};

/// Uplink as received from the radio
#[derive(Debug, Clone, PartialEq)]
pub struct RadioUplink {
    pub phy_payload: Vec<u8>,
    /// When the frame came off the air
    pub arrival: Instant,
    pub metadata: RadioMetadata,
}

impl RadioUplink {
    /// Uplink that arrived just now
    pub fn now(phy_payload: Vec<u8>, metadata: RadioMetadata) -> Self {
        Self {
            phy_payload,
            arrival: Instant::now(),
            metadata,
        }
    }
}

/// Final result of one uplink
#[derive(Debug, Clone, PartialEq)]
pub enum UplinkOutcome {
    /// Processed; carries the downlink to send, if one is owed
    Succeeded(Option<DownlinkFrame>),
    Failed(UplinkFailure),
}

impl UplinkOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UplinkOutcome::Succeeded(_))
    }

    pub fn downlink(&self) -> Option<&DownlinkFrame> {
        match self {
            UplinkOutcome::Succeeded(downlink) => downlink.as_ref(),
            UplinkOutcome::Failed(_) => None,
        }
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            UplinkOutcome::Succeeded(_) => None,
            UplinkOutcome::Failed(failure) => Some(failure.reason),
        }
    }
}

impl From<Result<Option<DownlinkFrame>, UplinkFailure>> for UplinkOutcome {
    fn from(result: Result<Option<DownlinkFrame>, UplinkFailure>) -> Self {
        match result {
            Ok(downlink) => UplinkOutcome::Succeeded(downlink),
            Err(failure) => UplinkOutcome::Failed(failure),
        }
    }
}

/// Handle on an uplink submitted for processing
#[derive(Debug)]
pub struct PendingUplink {
    outcome: oneshot::Receiver<UplinkOutcome>,
}

impl PendingUplink {
    /// Wait for the outcome
    pub async fn wait(self) -> UplinkOutcome {
        self.outcome.await.unwrap_or(UplinkOutcome::Failed(UplinkFailure::unloaded(
            FailureReason::BackendUnavailable,
        )))
    }

    /// Outcome if already available; `None` while still pending
    pub fn try_outcome(&mut self) -> Option<UplinkOutcome> {
        self.outcome.try_recv().ok()
    }
}

pub struct Dispatcher {
    config: Arc<ServerConfig>,
    registry: Registry,
    data: DataMessageHandler,
    join: JoinRequestHandler,
}

impl Dispatcher {
    pub fn new(
        config: Arc<ServerConfig>,
        store: Arc<dyn DeviceStore>,
        cloud: Arc<dyn CloudMessageQueue>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let registry = Registry::new(config.clone(), store.clone());
        Self {
            data: DataMessageHandler::new(config.clone(), store.clone(), cloud, telemetry),
            join: JoinRequestHandler::new(config.clone(), store, registry.clone()),
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Process one uplink to completion
    pub async fn dispatch(&self, uplink: RadioUplink) -> UplinkOutcome {
        let outcome = match mac::parse_uplink(&uplink.phy_payload) {
            Ok(UplinkFrame::Data(frame)) => self.dispatch_data(&frame, &uplink).await,
            Ok(UplinkFrame::Join(request)) => self
                .join
                .handle(&request, &uplink.metadata, uplink.arrival)
                .await
                .map(Some)
                .into(),
            Err(err) => {
                debug!(size = uplink.phy_payload.len(), error = %err, "undecodable uplink");
                UplinkOutcome::Failed(UplinkFailure::unloaded(FailureReason::InvalidFrame))
            }
        };

        match &outcome {
            UplinkOutcome::Succeeded(downlink) => debug!(
                downlink = downlink.is_some(),
                elapsed_ms = uplink.arrival.elapsed().as_millis() as u64,
                "uplink processed"
            ),
            UplinkOutcome::Failed(failure) => info!(
                reason = failure.reason.code(),
                stage = ?failure.stage,
                elapsed_ms = uplink.arrival.elapsed().as_millis() as u64,
                "uplink failed"
            ),
        }
        outcome
    }

    async fn dispatch_data(&self, frame: &DataFrame, uplink: &RadioUplink) -> UplinkOutcome {
        let dev_addr = frame.dev_addr();
        if !self.config.accepts_dev_addr(dev_addr) {
            debug!(%dev_addr, nwk_id = dev_addr.nwk_id(), "uplink from a foreign network");
            return UplinkOutcome::Failed(UplinkFailure::unloaded(FailureReason::InvalidNetworkId));
        }

        let device = match self.registry.resolve_for_frame(frame).await {
            Ok(device) => device,
            Err(reason) => return UplinkOutcome::Failed(UplinkFailure::unloaded(reason)),
        };

        let result = self
            .data
            .handle(
                &device,
                DataUplink {
                    frame,
                    metadata: &uplink.metadata,
                    arrival: uplink.arrival,
                },
            )
            .await;
        if let Err(failure) = &result {
            if failure.reason == FailureReason::BelongsToAnotherGateway {
                self.registry.invalidate(device.dev_eui());
            }
        }
        result.into()
    }

    /// Process an uplink on its own task
    pub fn submit(self: &Arc<Self>, uplink: RadioUplink) -> PendingUplink {
        let (reply, outcome) = oneshot::channel();
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = dispatcher.dispatch(uplink).await;
            // the submitter may have dropped its handle
            let _ = reply.send(outcome);
        });
        PendingUplink { outcome }
    }
}
