//! Devices known to the network server
//!
//! A [`LoRaDevice`] is the exclusive execution slot of one end-device: it
//! owns the [`DeviceSession`] behind a FIFO async mutex, so uplinks for the
//! same device run one after another, and keeps the small amount of data
//! needed to authenticate a frame readable without taking that lock.

/// Adaptive data rate
pub mod adr;

/// Frame counter arithmetic
pub mod fcnt;

/// Session state
pub mod session;

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use crate::config::device::{AESKey, DevAddr, EUI64};
use crate::lorawan::mac::DataFrame;

pub use adr::{AdrHistory, AdrSettings};
pub use fcnt::{FcntDecision, FcntState};
pub use session::DeviceSession;

/// One end-device and its session
#[derive(Debug)]
pub struct LoRaDevice {
    dev_eui: EUI64,
    dev_addr: DevAddr,
    nwk_skey: AESKey,
    supports_32bit_fcnt: bool,
    abp_relaxed: bool,
    keep_alive_timeout: Option<Duration>,
    /// Last accepted uplink counter, for authentication outside the lock
    fcnt_up_hint: AtomicU32,
    session: Mutex<DeviceSession>,
}

impl LoRaDevice {
    pub fn new(session: DeviceSession) -> Self {
        Self {
            dev_eui: session.dev_eui,
            dev_addr: session.dev_addr,
            nwk_skey: session.nwk_skey,
            supports_32bit_fcnt: session.supports_32bit_fcnt,
            abp_relaxed: session.abp_relaxed,
            keep_alive_timeout: session.keep_alive_timeout,
            fcnt_up_hint: AtomicU32::new(session.fcnt_up()),
            session: Mutex::new(session),
        }
    }

    pub fn dev_eui(&self) -> EUI64 {
        self.dev_eui
    }

    pub fn dev_addr(&self) -> DevAddr {
        self.dev_addr
    }

    /// How long the cached session may sit idle before it is dropped
    pub fn keep_alive_timeout(&self) -> Option<Duration> {
        self.keep_alive_timeout
    }

    /// Wait for exclusive use of the session; waiters are served in arrival order
    pub async fn lock(&self) -> MutexGuard<'_, DeviceSession> {
        self.session.lock().await
    }

    /// Publish the counter accepted by the state machine
    pub fn update_fcnt_hint(&self, fcnt_up: u32) {
        self.fcnt_up_hint.store(fcnt_up, Ordering::Release);
    }

    /// Whether this device's network key signed the frame.
    ///
    /// Relaxed devices may have restarted their counter, so the raw 16-bit
    /// value is tried as well.
    pub fn authenticates(&self, frame: &DataFrame) -> bool {
        if frame.dev_addr() != self.dev_addr {
            return false;
        }
        let last = self.fcnt_up_hint.load(Ordering::Acquire);
        let incoming = frame.fhdr.f_cnt;
        let counter = fcnt::resolve(last, incoming, self.supports_32bit_fcnt);
        frame.verify_mic(&self.nwk_skey, counter)
            || (self.abp_relaxed
                && counter != u32::from(incoming)
                && frame.verify_mic(&self.nwk_skey, u32::from(incoming)))
    }
}
