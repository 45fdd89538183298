//! Single-flight loading of one radio address
//!
//! A loader owns the queue of frames waiting on its address. It performs a
//! single candidate lookup, loads the candidate sessions in parallel,
//! publishes the result to the registry and only then answers every queued
//! frame. Frames that arrive after it unregistered find the cache entry.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{authenticate, RegistryInner};
use crate::config::device::{DevAddr, EUI64};
use crate::device::{DeviceSession, LoRaDevice};
use crate::error::{FailureReason, StoreError};
use crate::lorawan::mac::DataFrame;

/// Frame waiting for its address to be resolved
pub(crate) struct LoadRequest {
    pub(crate) frame: Arc<DataFrame>,
    pub(crate) reply: oneshot::Sender<Result<Arc<LoRaDevice>, FailureReason>>,
}

enum CandidateLoad {
    Loaded(Arc<LoRaDevice>),
    /// Unknown to the store, or now using another address
    Skipped,
    Failed,
}

pub(crate) struct Loader {
    registry: Arc<RegistryInner>,
    dev_addr: DevAddr,
    queue: mpsc::UnboundedReceiver<LoadRequest>,
}

impl Loader {
    pub(crate) fn spawn(
        registry: Arc<RegistryInner>,
        dev_addr: DevAddr,
        queue: mpsc::UnboundedReceiver<LoadRequest>,
    ) {
        let loader = Self {
            registry,
            dev_addr,
            queue,
        };
        tokio::spawn(loader.run());
    }

    async fn run(mut self) {
        let dev_addr = self.dev_addr;
        let result = self.load().await;

        if let Ok(devices) = &result {
            self.registry
                .addresses
                .insert(dev_addr, Arc::new(devices.clone()));
        }
        self.registry.loaders.remove(&dev_addr);
        self.queue.close();

        let mut served = 0usize;
        while let Some(request) = self.queue.recv().await {
            let outcome = match &result {
                Ok(devices) => authenticate(devices, &request.frame),
                Err(reason) => Err(*reason),
            };
            // the caller may have given up on the request
            let _ = request.reply.send(outcome);
            served += 1;
        }
        debug!(%dev_addr, served, ok = result.is_ok(), "loader finished");
    }

    async fn load(&self) -> Result<Vec<Arc<LoRaDevice>>, FailureReason> {
        let dev_addr = self.dev_addr;
        let candidates = self
            .registry
            .store
            .fetch_candidates_by_address(dev_addr)
            .await
            .map_err(|err| {
                warn!(%dev_addr, error = %err, "candidate lookup failed");
                FailureReason::BackendUnavailable
            })?;

        let loads = candidates
            .iter()
            .filter(|c| c.dev_addr == dev_addr)
            .map(|c| self.load_candidate(c.dev_eui));
        let mut devices = Vec::new();
        let mut failures = 0usize;
        for load in join_all(loads).await {
            match load {
                CandidateLoad::Loaded(device) => devices.push(device),
                CandidateLoad::Skipped => {}
                CandidateLoad::Failed => failures += 1,
            }
        }

        if devices.is_empty() {
            info!(%dev_addr, candidates = candidates.len(), failures, "no device loaded");
            return Err(if failures > 0 {
                FailureReason::BackendUnavailable
            } else {
                FailureReason::NotMatchingDeviceByAddress
            });
        }
        debug!(%dev_addr, devices = devices.len(), failures, "address loaded");
        Ok(devices)
    }

    async fn load_candidate(&self, dev_eui: EUI64) -> CandidateLoad {
        if let Some(device) = self.registry.sessions.get(&dev_eui) {
            if device.dev_addr() == self.dev_addr {
                return CandidateLoad::Loaded(device);
            }
        }

        let timeout = self.registry.config.candidate_fetch_timeout();
        let fetched = tokio::time::timeout(timeout, self.registry.store.fetch_session(dev_eui))
            .await
            .unwrap_or(Err(StoreError::Timeout));
        match fetched {
            Ok(Some(attrs)) if attrs.dev_addr == self.dev_addr => {
                let session = DeviceSession::from_attributes(attrs, &self.registry.config);
                let device = Arc::new(LoRaDevice::new(session));
                self.registry.sessions.insert(dev_eui, device.clone());
                CandidateLoad::Loaded(device)
            }
            Ok(Some(attrs)) => {
                debug!(%dev_eui, expected = %self.dev_addr, actual = %attrs.dev_addr, "candidate moved to another address");
                CandidateLoad::Skipped
            }
            Ok(None) => CandidateLoad::Skipped,
            Err(err) => {
                warn!(%dev_eui, dev_addr = %self.dev_addr, error = %err, "candidate session fetch failed");
                CandidateLoad::Failed
            }
        }
    }
}
