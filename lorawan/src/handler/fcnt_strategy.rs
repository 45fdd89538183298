//! Downlink frame counter allocation
//!
//! A device owned by this gateway counts its downlinks locally. A device
//! shared by several gateways needs the device store to hand out counters so
//! only one gateway answers each uplink.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::device::DeviceSession;
use crate::error::StoreError;
use crate::store::DeviceStore;

#[async_trait]
pub trait FrameCounterStrategy: Send + Sync {
    /// Counter for the next downlink; `None` when another gateway answers
    async fn next_fcnt_down(
        &self,
        session: &mut DeviceSession,
        fcnt_up: u32,
    ) -> Result<Option<u32>, StoreError>;

    /// Propagate a counter reset
    async fn on_reset(&self, session: &DeviceSession) -> Result<(), StoreError>;

    /// Whether allocating a counter changed state that must be written back
    fn persists_allocation(&self) -> bool;
}

/// Counters for a device owned by this gateway
#[derive(Debug, Default)]
pub struct SingleGatewayStrategy;

#[async_trait]
impl FrameCounterStrategy for SingleGatewayStrategy {
    async fn next_fcnt_down(
        &self,
        session: &mut DeviceSession,
        _fcnt_up: u32,
    ) -> Result<Option<u32>, StoreError> {
        Ok(Some(session.issue_fcnt_down()))
    }

    async fn on_reset(&self, _session: &DeviceSession) -> Result<(), StoreError> {
        Ok(())
    }

    fn persists_allocation(&self) -> bool {
        false
    }
}

/// Counters for a device several gateways can hear
pub struct MultiGatewayStrategy {
    store: Arc<dyn DeviceStore>,
    gateway_id: String,
}

impl MultiGatewayStrategy {
    pub fn new(store: Arc<dyn DeviceStore>, gateway_id: String) -> Self {
        Self { store, gateway_id }
    }
}

#[async_trait]
impl FrameCounterStrategy for MultiGatewayStrategy {
    async fn next_fcnt_down(
        &self,
        session: &mut DeviceSession,
        fcnt_up: u32,
    ) -> Result<Option<u32>, StoreError> {
        let allocated = self
            .store
            .allocate_next_downlink_counter(
                session.dev_eui,
                session.fcnt_down(),
                fcnt_up,
                &self.gateway_id,
            )
            .await?;
        match allocated {
            Some(fcnt_down) => {
                session.adopt_fcnt_down(fcnt_down);
                Ok(Some(fcnt_down))
            }
            None => {
                debug!(dev_eui = %session.dev_eui, fcnt_up, "downlink counter taken by another gateway");
                Ok(None)
            }
        }
    }

    async fn on_reset(&self, session: &DeviceSession) -> Result<(), StoreError> {
        self.store
            .reset_frame_counter_cache(
                session.dev_eui,
                session.fcnt_reset_reported(),
                &self.gateway_id,
            )
            .await
    }

    fn persists_allocation(&self) -> bool {
        true
    }
}

/// Both strategies, picked per session by ownership
pub struct FrameCounterStrategies {
    single: SingleGatewayStrategy,
    multi: MultiGatewayStrategy,
}

impl FrameCounterStrategies {
    pub fn new(store: Arc<dyn DeviceStore>, gateway_id: String) -> Self {
        Self {
            single: SingleGatewayStrategy,
            multi: MultiGatewayStrategy::new(store, gateway_id),
        }
    }

    pub fn for_session(&self, session: &DeviceSession) -> &dyn FrameCounterStrategy {
        if session.gateway_id.is_some() {
            &self.single
        } else {
            &self.multi
        }
    }
}
