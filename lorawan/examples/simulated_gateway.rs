//! Simulated Gateway Example
//!
//! This example runs the network server against in-memory collaborators:
//! - An OTAA device joins and derives its session keys
//! - The device sends a few unconfirmed and confirmed uplinks
//! - A cloud-to-device message is queued and delivered in RX1
//! - Every outcome and downlink is printed
//!
//! Set `RUST_LOG=lorawan_ns=debug` to follow the state machine.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lorawan_ns::config::device::{AESKey, DevAddr, EUI64};
use lorawan_ns::config::ServerConfig;
use lorawan_ns::crypto;
use lorawan_ns::dispatcher::{Dispatcher, RadioUplink};
use lorawan_ns::error::StoreError;
use lorawan_ns::lorawan::mac::{self, FCtrl, JoinAccept, MType, FHDR};
use lorawan_ns::lorawan::phy::RadioMetadata;
use lorawan_ns::store::{
    CloudMessage, CloudMessageQueue, DeviceCandidate, DeviceStore, JoinInfo, SessionAttributes,
    SessionDelta, Telemetry, TelemetrySink,
};

const DEV_EUI: EUI64 = EUI64::new([0x00, 0x04, 0xA3, 0x0B, 0x00, 0x1C, 0x05, 0x30]);
const JOIN_EUI: EUI64 = EUI64::new([0x70, 0xB3, 0xD5, 0x7E, 0xD0, 0x00, 0x00, 0x01]);
const APP_KEY: AESKey = AESKey::new([
    0x2B, 0x7E, 0x15, 0x16, 0x28, 0xAE, 0xD2, 0xA6, 0xAB, 0xF7, 0x15, 0x88, 0x09, 0xCF, 0x4F, 0x3C,
]);

#[derive(Default)]
struct MemoryStore {
    sessions: Mutex<HashMap<EUI64, SessionAttributes>>,
    join_infos: Mutex<HashMap<EUI64, JoinInfo>>,
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn fetch_session(&self, dev_eui: EUI64) -> Result<Option<SessionAttributes>, StoreError> {
        Ok(self.sessions.lock().unwrap().get(&dev_eui).cloned())
    }

    async fn fetch_candidates_by_address(
        &self,
        dev_addr: DevAddr,
    ) -> Result<Vec<DeviceCandidate>, StoreError> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.dev_addr == dev_addr)
            .map(|s| DeviceCandidate {
                dev_addr: s.dev_addr,
                dev_eui: s.dev_eui,
            })
            .collect())
    }

    async fn persist_session_delta(
        &self,
        dev_eui: EUI64,
        delta: SessionDelta,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().unwrap();
        if !sessions.contains_key(&dev_eui) {
            let (Some(dev_addr), Some(nwk), Some(app)) = (delta.dev_addr, delta.nwk_skey, delta.app_skey)
            else {
                return Err(StoreError::Rejected("unknown device".into()));
            };
            sessions.insert(dev_eui, SessionAttributes::new(dev_eui, dev_addr, nwk, app));
        }
        let Some(session) = sessions.get_mut(&dev_eui) else {
            return Err(StoreError::Rejected("unknown device".into()));
        };
        if delta.gateway_id.is_some() {
            session.gateway_id = delta.gateway_id;
        }
        session.fcnt_up = delta.fcnt_up.unwrap_or(session.fcnt_up);
        session.fcnt_down = delta.fcnt_down.unwrap_or(session.fcnt_down);
        session.dev_nonce = delta.dev_nonce.or(session.dev_nonce);
        Ok(())
    }

    async fn allocate_next_downlink_counter(
        &self,
        _dev_eui: EUI64,
        current: u32,
        _fcnt_up: u32,
        _gateway_id: &str,
    ) -> Result<Option<u32>, StoreError> {
        Ok(Some(current))
    }

    async fn reset_frame_counter_cache(
        &self,
        _dev_eui: EUI64,
        _generation: Option<u32>,
        _gateway_id: &str,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn fetch_join_info(&self, dev_eui: EUI64) -> Result<Option<JoinInfo>, StoreError> {
        Ok(self.join_infos.lock().unwrap().get(&dev_eui).cloned())
    }
}

#[derive(Default)]
struct MemoryQueue(Mutex<VecDeque<CloudMessage>>);

#[async_trait]
impl CloudMessageQueue for MemoryQueue {
    async fn receive(
        &self,
        _dev_eui: EUI64,
        _wait: Duration,
    ) -> Result<Option<CloudMessage>, StoreError> {
        Ok(self.0.lock().unwrap().pop_front())
    }

    async fn complete(&self, _dev_eui: EUI64, message: &CloudMessage) -> Result<(), StoreError> {
        println!("cloud message {} delivered", message.id);
        Ok(())
    }

    async fn abandon(&self, _dev_eui: EUI64, message: &CloudMessage) -> Result<(), StoreError> {
        self.0.lock().unwrap().push_front(message.clone());
        Ok(())
    }

    async fn reject(&self, _dev_eui: EUI64, message: &CloudMessage) -> Result<(), StoreError> {
        println!("cloud message {} rejected", message.id);
        Ok(())
    }
}

struct PrintSink;

#[async_trait]
impl TelemetrySink for PrintSink {
    async fn send(&self, telemetry: Telemetry) -> Result<(), StoreError> {
        println!(
            "telemetry from {} fcnt {}: {:?}",
            telemetry.dev_eui,
            telemetry.fcnt,
            String::from_utf8_lossy(&telemetry.payload)
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(ServerConfig::load(None)?);
    lorawan_ns::logging::init_tracing(&config);

    let store = Arc::new(MemoryStore::default());
    let mut info = JoinInfo::new(APP_KEY, JOIN_EUI);
    info.gateway_id = Some(config.gateway_id.clone());
    store.join_infos.lock().unwrap().insert(DEV_EUI, info);
    let queue = Arc::new(MemoryQueue::default());
    let dispatcher = Arc::new(Dispatcher::new(
        config.clone(),
        store,
        queue.clone(),
        Arc::new(PrintSink),
    ));
    let metadata = RadioMetadata::default();

    // Join
    let dev_nonce = 1;
    let request = mac::build_join_request(&APP_KEY, JOIN_EUI, DEV_EUI, dev_nonce);
    let outcome = dispatcher
        .submit(RadioUplink::now(request, metadata.clone()))
        .wait()
        .await;
    let Some(accept) = outcome.downlink() else {
        return Err(format!("join failed: {outcome:?}").into());
    };
    let accept = JoinAccept::decode(&APP_KEY, &accept.payload)?;
    let (nwk_skey, app_skey) =
        crypto::derive_session_keys(&APP_KEY, &accept.app_nonce, accept.net_id, dev_nonce);
    println!("joined as {}", accept.dev_addr);

    queue.0.lock().unwrap().push_back(CloudMessage {
        id: "greeting".into(),
        f_port: 10,
        payload: b"welcome".to_vec(),
        confirmed: false,
        mac_commands: Vec::new(),
        expires_at: None,
    });

    for fcnt in 0..4u32 {
        let mtype = if fcnt % 2 == 1 {
            MType::ConfirmedDataUp
        } else {
            MType::UnconfirmedDataUp
        };
        let fhdr = FHDR::new(accept.dev_addr, FCtrl::default(), fcnt as u16);
        let payload = format!("reading #{fcnt}");
        let frame = mac::build_data_frame(
            mtype,
            &fhdr,
            Some(1),
            payload.as_bytes(),
            &nwk_skey,
            &app_skey,
            fcnt,
        )?;

        let outcome = dispatcher
            .submit(RadioUplink::now(frame, metadata.clone()))
            .wait()
            .await;
        match outcome.downlink() {
            Some(downlink) => println!(
                "uplink {fcnt}: downlink of {} bytes in {:?} at tmst {} on {} Hz",
                downlink.payload.len(),
                downlink.window,
                downlink.tmst,
                downlink.frequency
            ),
            None => println!("uplink {fcnt}: {outcome:?}"),
        }
    }
    Ok(())
}
