//! Uplink handling
//!
//! [`data`] runs the per-device state machine for data frames, [`join`]
//! answers join requests, [`downlink`] packs answers into frames and
//! [`fcnt_strategy`] decides who counts downlinks.

/// Data uplink state machine
pub mod data;

/// Downlink assembly and window parameters
pub mod downlink;

/// Downlink frame counter allocation
pub mod fcnt_strategy;

/// OTAA join handling
pub mod join;

use tracing::trace;

use crate::config::device::EUI64;
use crate::error::FailureReason;

pub use data::{DataMessageHandler, DataUplink};
pub use downlink::{CloudFit, DownlinkBuilder, DownlinkFrame, WindowParams};
pub use fcnt_strategy::{FrameCounterStrategies, FrameCounterStrategy};
pub use join::JoinRequestHandler;

/// Progress of one uplink request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UplinkStage {
    /// Not yet bound to a device session
    Unloaded,
    Authenticating,
    FrameCounterCheck,
    Processing,
    Committed,
    Rejected,
}

/// A rejected uplink: the reason and the stage it was rejected in
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{reason} ({stage:?})")]
pub struct UplinkFailure {
    pub reason: FailureReason,
    pub stage: UplinkStage,
}

impl UplinkFailure {
    /// Failure before any device session was involved
    pub fn unloaded(reason: FailureReason) -> Self {
        Self {
            reason,
            stage: UplinkStage::Unloaded,
        }
    }
}

/// Stage bookkeeping of one request
#[derive(Debug)]
pub(crate) struct StageTracker {
    dev_eui: EUI64,
    stage: UplinkStage,
}

impl StageTracker {
    pub(crate) fn new(dev_eui: EUI64) -> Self {
        Self {
            dev_eui,
            stage: UplinkStage::Unloaded,
        }
    }

    pub(crate) fn enter(&mut self, stage: UplinkStage) {
        trace!(dev_eui = %self.dev_eui, from = ?self.stage, to = ?stage, "uplink stage");
        self.stage = stage;
    }

    /// Reject in the current stage
    pub(crate) fn fail(&mut self, reason: FailureReason) -> UplinkFailure {
        let failure = UplinkFailure {
            reason,
            stage: self.stage,
        };
        self.enter(UplinkStage::Rejected);
        failure
    }
}
