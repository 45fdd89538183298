//! Device resolution
//!
//! The registry maps a radio address to the devices currently using it.
//! Lookups are served from an in-process cache whose entries live for
//! `dev_addr_reload_interval`; a miss hands the frame to the single
//! [`loader`] of that address, which asks the device store once for every
//! frame queued while it runs.

/// Single-flight address loader
pub mod loader;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use moka::sync::Cache;
use moka::Expiry;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::config::device::{DevAddr, EUI64};
use crate::config::ServerConfig;
use crate::device::{DeviceSession, LoRaDevice};
use crate::error::FailureReason;
use crate::lorawan::mac::DataFrame;
use crate::store::{DeviceStore, SessionAttributes};

use loader::{LoadRequest, Loader};

/// Devices sharing one radio address
pub type AddressEntry = Arc<Vec<Arc<LoRaDevice>>>;

pub(crate) struct RegistryInner {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) store: Arc<dyn DeviceStore>,
    pub(crate) addresses: Cache<DevAddr, AddressEntry>,
    pub(crate) sessions: Cache<EUI64, Arc<LoRaDevice>>,
    pub(crate) loaders: DashMap<DevAddr, mpsc::UnboundedSender<LoadRequest>>,
}

/// Process-wide device cache
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new(config: Arc<ServerConfig>, store: Arc<dyn DeviceStore>) -> Self {
        let addresses = Cache::builder()
            .time_to_live(config.dev_addr_reload_interval())
            .build();
        let sessions = Cache::builder()
            .expire_after(SessionExpiry {
                idle: config.session_idle_timeout(),
            })
            .build();
        Self {
            inner: Arc::new(RegistryInner {
                config,
                store,
                addresses,
                sessions,
                loaders: DashMap::new(),
            }),
        }
    }

    /// Cached devices for an address, without I/O
    pub fn resolve(&self, dev_addr: DevAddr) -> Option<Vec<Arc<LoRaDevice>>> {
        self.inner
            .addresses
            .get(&dev_addr)
            .map(|entry| entry.iter().cloned().collect())
    }

    /// Cached device by DevEUI
    pub fn get(&self, dev_eui: EUI64) -> Option<Arc<LoRaDevice>> {
        self.inner.sessions.get(&dev_eui)
    }

    /// Device whose session signed `frame`.
    ///
    /// A cache hit never touches the backend: when no cached device
    /// authenticates the frame it fails until the entry expires.
    pub async fn resolve_for_frame(
        &self,
        frame: &DataFrame,
    ) -> Result<Arc<LoRaDevice>, FailureReason> {
        let dev_addr = frame.dev_addr();
        let frame = Arc::new(frame.clone());
        loop {
            if let Some(entry) = self.inner.addresses.get(&dev_addr) {
                trace!(%dev_addr, devices = entry.len(), "address cache hit");
                return authenticate(&entry, &frame);
            }

            let (reply, response) = oneshot::channel();
            let request = LoadRequest {
                frame: frame.clone(),
                reply,
            };
            match self.inner.loaders.entry(dev_addr) {
                Entry::Occupied(loader) => {
                    if loader.get().send(request).is_err() {
                        // loaders unregister before closing their queue, so
                        // this one died without cleaning up
                        loader.remove();
                        continue;
                    }
                    trace!(%dev_addr, "queued on running loader");
                }
                Entry::Vacant(slot) => {
                    if self.inner.addresses.contains_key(&dev_addr) {
                        continue;
                    }
                    let (queue, requests) = mpsc::unbounded_channel();
                    // receiver is alive, send cannot fail
                    let _ = queue.send(request);
                    slot.insert(queue);
                    debug!(%dev_addr, "address cache miss, starting loader");
                    Loader::spawn(self.inner.clone(), dev_addr, requests);
                }
            }

            return response
                .await
                .unwrap_or(Err(FailureReason::BackendUnavailable));
        }
    }

    /// Install the session of a device that just joined, replacing whatever
    /// was cached for it
    pub fn get_or_create_for_join(&self, attrs: SessionAttributes) -> Arc<LoRaDevice> {
        let dev_eui = attrs.dev_eui;
        let dev_addr = attrs.dev_addr;
        if let Some(previous) = self.inner.sessions.get(&dev_eui) {
            self.remove_from_address(previous.dev_addr(), dev_eui);
        }

        let device = Arc::new(LoRaDevice::new(DeviceSession::from_attributes(
            attrs,
            &self.inner.config,
        )));
        self.inner.sessions.insert(dev_eui, device.clone());

        // only refresh a live entry; otherwise the next uplink loads the
        // address and picks the session up from the index
        if let Some(entry) = self.inner.addresses.get(&dev_addr) {
            let mut devices: Vec<_> = entry
                .iter()
                .filter(|d| d.dev_eui() != dev_eui)
                .cloned()
                .collect();
            devices.push(device.clone());
            self.inner.addresses.insert(dev_addr, Arc::new(devices));
        }
        info!(%dev_eui, %dev_addr, "session installed after join");
        device
    }

    /// Forget one device
    pub fn invalidate(&self, dev_eui: EUI64) {
        if let Some(device) = self.inner.sessions.get(&dev_eui) {
            self.inner.sessions.invalidate(&dev_eui);
            self.remove_from_address(device.dev_addr(), dev_eui);
            debug!(%dev_eui, "device invalidated");
        }
    }

    /// Forget an address and every device cached under it
    pub fn invalidate_address(&self, dev_addr: DevAddr) {
        if let Some(entry) = self.inner.addresses.get(&dev_addr) {
            for device in entry.iter() {
                self.inner.sessions.invalidate(&device.dev_eui());
            }
        }
        self.inner.addresses.invalidate(&dev_addr);
        debug!(%dev_addr, "address invalidated");
    }

    /// Loaders currently waiting on the device store
    pub fn loaders_in_flight(&self) -> usize {
        self.inner.loaders.len()
    }

    fn remove_from_address(&self, dev_addr: DevAddr, dev_eui: EUI64) {
        if let Some(entry) = self.inner.addresses.get(&dev_addr) {
            let remaining: Vec<_> = entry
                .iter()
                .filter(|d| d.dev_eui() != dev_eui)
                .cloned()
                .collect();
            if remaining.is_empty() {
                self.inner.addresses.invalidate(&dev_addr);
            } else {
                self.inner.addresses.insert(dev_addr, Arc::new(remaining));
            }
        }
    }
}

/// Idle eviction of cached sessions: a device's keep-alive timeout when it
/// has one, `session_idle_timeout` otherwise
struct SessionExpiry {
    idle: Duration,
}

impl SessionExpiry {
    fn idle_for(&self, device: &LoRaDevice) -> Option<Duration> {
        Some(device.keep_alive_timeout().unwrap_or(self.idle))
    }
}

impl Expiry<EUI64, Arc<LoRaDevice>> for SessionExpiry {
    fn expire_after_create(
        &self,
        _key: &EUI64,
        device: &Arc<LoRaDevice>,
        _: Instant,
    ) -> Option<Duration> {
        self.idle_for(device)
    }

    fn expire_after_read(
        &self,
        _key: &EUI64,
        device: &Arc<LoRaDevice>,
        _: Instant,
        _current: Option<Duration>,
        _: Instant,
    ) -> Option<Duration> {
        self.idle_for(device)
    }

    fn expire_after_update(
        &self,
        _key: &EUI64,
        device: &Arc<LoRaDevice>,
        _: Instant,
        _current: Option<Duration>,
    ) -> Option<Duration> {
        self.idle_for(device)
    }
}

/// First device of the entry whose key signed the frame
pub(crate) fn authenticate(
    devices: &[Arc<LoRaDevice>],
    frame: &DataFrame,
) -> Result<Arc<LoRaDevice>, FailureReason> {
    devices
        .iter()
        .find(|device| device.authenticates(frame))
        .cloned()
        .ok_or_else(|| {
            debug!(
                dev_addr = %frame.dev_addr(),
                candidates = devices.len(),
                "no device authenticated the frame"
            );
            FailureReason::NotMatchingDeviceByAddress
        })
}
